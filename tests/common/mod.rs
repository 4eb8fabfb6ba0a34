// tests/common/mod.rs
#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;

use ner_rpc::{
    // ---
    decode_request,
    encode_response,
    ConnectionState,
    EntitySpan,
    Envelope,
    MemoryBroker,
    PredictRequest,
    ReconnectPolicy,
    RpcClient,
    RpcClientBuilder,
    CONTENT_TYPE_JSON,
    DEFAULT_REQUEST_QUEUE,
};

/// What the scripted worker does with one request.
pub enum Action {
    Reply(Vec<EntitySpan>),
    ReplyAfter(Duration, Vec<EntitySpan>),
    /// Send this body verbatim.
    Raw(Bytes),
    /// Answer twice with the same correlation id.
    Twice(Vec<EntitySpan>, Vec<EntitySpan>),
    Ignore,
}

/// One span covering the whole input, labeled with the input itself.
pub fn echo(req: &PredictRequest) -> Action {
    Action::Reply(echo_spans(&req.input))
}

pub fn echo_spans(input: &str) -> Vec<EntitySpan> {
    vec![EntitySpan::new(0, input.chars().count() as i64, input)]
}

/// In-process prediction worker consuming the request queue.
pub struct Worker {
    /// Every request envelope received, in arrival order.
    pub seen: Arc<Mutex<Vec<Envelope>>>,
    handle: JoinHandle<()>,
}

impl Worker {
    pub fn spawn<F>(broker: &MemoryBroker, script: F) -> Self
    where
        F: Fn(&PredictRequest) -> Action + Send + Sync + 'static,
    {
        // ---
        let mut inbox = broker.consume(DEFAULT_REQUEST_QUEUE);
        let broker = broker.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let seen = seen.clone();
            tokio::spawn(async move {
                while let Some(env) = inbox.recv().await {
                    seen.lock().unwrap().push(env.clone());

                    let req = decode_request(&env.payload).expect("worker got a bad request");
                    let action = script(&req);

                    let broker = broker.clone();
                    tokio::spawn(async move { answer(&broker, &env, action).await });
                }
            })
        };

        Self { seen, handle }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn answer(broker: &MemoryBroker, req: &Envelope, action: Action) {
    // ---
    let reply = |body: Bytes| {
        Envelope::response(
            req.reply_to.clone().expect("request without reply_to"),
            body,
            req.correlation_id.clone().expect("request without correlation id"),
            Arc::from(CONTENT_TYPE_JSON),
        )
    };

    match action {
        Action::Reply(spans) => broker.publish(reply(encode_response(&spans).unwrap())).await,
        Action::ReplyAfter(delay, spans) => {
            tokio::time::sleep(delay).await;
            broker.publish(reply(encode_response(&spans).unwrap())).await;
        }
        Action::Raw(body) => broker.publish(reply(body)).await,
        Action::Twice(first, second) => {
            broker.publish(reply(encode_response(&first).unwrap())).await;
            broker.publish(reply(encode_response(&second).unwrap())).await;
        }
        Action::Ignore => {}
    }
}

pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        enabled: true,
        max_attempts: 3,
        multiplier: 2.0,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    }
}

/// Builder preconfigured for `broker` with fast reconnects.
pub fn client_builder(broker: &MemoryBroker, id: &str) -> RpcClientBuilder {
    let policy = fast_reconnect();
    RpcClientBuilder::new(Arc::new(broker.clone()))
        .uri("memory://")
        .transport_id(id)
        .reconnect_max_attempts(policy.max_attempts)
        .reconnect_initial_delay(policy.initial_delay)
        .reconnect_max_delay(policy.max_delay)
}

pub async fn connected_client(broker: &MemoryBroker, id: &str) -> RpcClient {
    let client = client_builder(broker, id).build().unwrap();
    client.connect().await.unwrap();
    client
}

/// Poll `cond` until it holds, panicking after two seconds.
pub async fn wait_until<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    // ---
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state<F>(client: &RpcClient, pred: F) -> ConnectionState
where
    F: FnMut(&ConnectionState) -> bool,
{
    // ---
    let mut rx = client.watch_state();
    let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
        .await
        .expect("timed out waiting for connection state")
        .expect("state channel closed");
    *state
}

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("operation did not finish in time")
}

static INIT: Once = Once::new();

pub fn init_logging() {
    // ---
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
