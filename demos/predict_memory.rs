//! Entity prediction using the in-memory broker.
//!
//! Runs a toy gazetteer worker and the RPC client in one process. Useful for
//! trying the client without RabbitMQ.
//!
//! Run with: cargo run --example predict_memory

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use ner_rpc::{
    // ---
    decode_request,
    encode_response,
    EntitySpan,
    Envelope,
    MemoryBroker,
    Result,
    RpcClientBuilder,
    RpcConfig,
    TimingInterceptor,
    CONTENT_TYPE_JSON,
    DEFAULT_REQUEST_QUEUE,
};
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

const GAZETTEER: &[(&str, &str)] = &[
    ("Barack Obama", "PER"),
    ("Angela Merkel", "PER"),
    ("Paris", "LOC"),
    ("Berlin", "LOC"),
    ("United Nations", "ORG"),
];

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_format()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(true)
        .with_line_number(true)
        .init();

    let broker = MemoryBroker::new();
    let worker = spawn_worker(&broker);

    let client = RpcClientBuilder::new(Arc::new(broker.clone()))
        .config(RpcConfig::memory("predict-demo"))
        .interceptor(Arc::new(TimingInterceptor))
        .build()?;

    let texts = [
        "Barack Obama visited Paris",
        "Angela Merkel flew from Berlin to the United Nations",
        "nothing to see here",
    ];

    client
        .run_connected(|client| async move {
            for text in texts {
                let spans = client.predict(text).await?;
                println!("{text:?}");
                for span in spans {
                    let chars: String = text
                        .chars()
                        .skip(span.start_index as usize)
                        .take((span.end_index - span.start_index) as usize)
                        .collect();
                    println!("    {:>3}..{:<3} {:<4} {chars}", span.start_index, span.end_index, span.entity);
                }
            }
            Ok(())
        })
        .await?;

    worker.abort();
    Ok(())
}

/// Consume the request queue and answer from the gazetteer.
fn spawn_worker(broker: &MemoryBroker) -> tokio::task::JoinHandle<()> {
    // ---
    let mut inbox = broker.consume(DEFAULT_REQUEST_QUEUE);
    let broker = broker.clone();

    tokio::spawn(async move {
        while let Some(req) = inbox.recv().await {
            let (Some(reply_to), Some(corr)) = (req.reply_to.clone(), req.correlation_id.clone())
            else {
                continue;
            };
            let Ok(predict) = decode_request(&req.payload) else {
                continue;
            };

            let spans = tag(&predict.input);
            let body = encode_response(&spans).expect("spans always encode");
            broker
                .publish(Envelope::response(reply_to, body, corr, Arc::from(CONTENT_TYPE_JSON)))
                .await;
        }
    })
}

fn tag(text: &str) -> Vec<EntitySpan> {
    // ---
    let mut spans: Vec<EntitySpan> = GAZETTEER
        .iter()
        .filter_map(|(name, label)| {
            let byte = text.find(name)?;
            let start = text[..byte].chars().count() as i64;
            Some(EntitySpan::new(start, start + name.chars().count() as i64, *label))
        })
        .collect();
    spans.sort_by_key(|s| s.start_index);
    spans
}
