//! AMQP transport implementation using `lapin`.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the AMQP connection and channel.
//! - The actor publishes requests, declares the reply queue and starts its
//!   consumer, and closes the connection on shutdown.
//! - All interaction with the AMQP client is serialized through the actor's
//!   command channel; callers wait on a oneshot responder.
//!
//! ## Wire mapping
//!
//! Requests go to the default exchange with the request queue as routing
//! key. The correlation id, reply address and content type travel as
//! message properties; the body is the JSON payload untouched.
//!
//! The reply queue is declared with an empty name (the broker picks one),
//! `exclusive` and `auto_delete`, non-durable. Each delivery is acked once on
//! receipt, before it is forwarded, so a reply that later fails to decode is
//! never redelivered.
//!
//! ## Link loss
//!
//! When the connection drops, the consumer stream ends and the reply inbox
//! closes. That closed inbox is the signal the client reconnects on. Dropping
//! the last transport handle ends the actor, which closes the connection.

use std::sync::Arc;

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    Consumer,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    Address,
    Connector,
    Envelope,
    ReplyQueue,
    Result,
    RpcConfig,
    RpcError,
    Transport,
    TransportPtr,
    CONTENT_TYPE_JSON,
};

const REPLY_INBOX_CAPACITY: usize = 64;

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        env: Envelope,
        resp: oneshot::Sender<Result<()>>,
    },
    DeclareReplyQueue {
        resp: oneshot::Sender<Result<ReplyQueue>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Connector that opens one AMQP connection and channel per session.
///
/// The broker address comes from [`RpcConfig::broker_uri`].
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, config: &RpcConfig) -> Result<TransportPtr> {
        // ---
        let (connection, channel) = create_amqp_connection(config).await?;
        Ok(AmqpTransport::create(&config.transport_id, connection, channel))
    }
}

/// AMQP session: the handle side of the actor.
struct AmqpTransport {
    // ---
    transport_id: String,
    cmd_tx: mpsc::Sender<Cmd>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpTransport {
    /// Spawn the actor owning `connection` and `channel`.
    fn create(transport_id: &str, connection: Connection, channel: Channel) -> TransportPtr {
        // ---
        let transport_id = transport_id.to_string();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let actor = Actor {
            transport_id: transport_id.clone(),
            connection,
            channel,
            cmd_rx,
            consumers: Vec::new(),
        };
        let handle = tokio::spawn(actor.run());

        Arc::new(Self {
            transport_id,
            cmd_tx,
            actor: Mutex::new(Some(handle)),
        })
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Cmd) -> Result<T> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx.send(make(tx)).await.map_err(|e| {
            RpcError::Transport(format!("[{}] actor command channel closed: {e}", self.transport_id))
        })?;

        rx.await.map_err(|e| {
            RpcError::Transport(format!("[{}] actor responder dropped: {e}", self.transport_id))
        })?
    }
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    transport_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    consumers: Vec<JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_debug!("[{}] AMQP actor started", self.transport_id);

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Cmd::Publish { env, resp } => {
                    let _ = resp.send(self.do_publish(env).await);
                }
                Cmd::DeclareReplyQueue { resp } => {
                    let _ = resp.send(self.do_declare_reply_queue().await);
                }
                Cmd::Close { resp } => {
                    let _ = resp.send(Ok(()));
                    break;
                }
            }
        }

        for handle in self.consumers.drain(..) {
            handle.abort();
        }

        let _ = self.channel.close(200, "Normal shutdown".into()).await;
        let _ = self.connection.close(200, "Normal shutdown".into()).await;

        log_info!("[{}] AMQP connection closed", self.transport_id);
    }

    async fn do_publish(&mut self, env: Envelope) -> Result<()> {
        // ---
        let queue = env.address.as_str();

        let mut props = BasicProperties::default().with_content_type(
            env.content_type
                .as_deref()
                .unwrap_or(CONTENT_TYPE_JSON)
                .into(),
        );
        if let Some(corr) = env.correlation_id.as_deref() {
            props = props.with_correlation_id(corr.into());
        }
        if let Some(reply_to) = &env.reply_to {
            props = props.with_reply_to(reply_to.as_str().into());
        }

        self.channel
            .basic_publish(
                "".into(),    // default exchange
                queue.into(), // routing key = queue name
                BasicPublishOptions::default(),
                &env.payload,
                props,
            )
            .await
            .map_err(|e| RpcError::Publish(format!("amqp: publish to {queue} failed: {e}")))?;

        log_debug!("[{}] published to {queue}", self.transport_id);
        Ok(())
    }

    async fn do_declare_reply_queue(&mut self) -> Result<ReplyQueue> {
        // ---
        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: false,
            exclusive: true,
            auto_delete: true,
            nowait: false,
        };

        let queue = self
            .channel
            .queue_declare("".into(), queue_opts, FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: reply queue declare failed: {e}")))?;

        let name = queue.name().as_str().to_string();

        let consumer = self
            .channel
            .basic_consume(
                name.clone().into(),
                format!("{}-replies", self.transport_id).into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: consume on {name} failed: {e}")))?;

        log_info!("[{}] consuming replies on {name}", self.transport_id);

        let (tx, rx) = mpsc::channel(REPLY_INBOX_CAPACITY);
        let address = Address::from(name);
        let handle = tokio::spawn(forward_replies(
            self.transport_id.clone(),
            address.clone(),
            consumer,
            tx,
        ));
        self.consumers.push(handle);

        Ok(ReplyQueue { address, inbox: rx })
    }
}

/// Ack each delivery and forward it as an [`Envelope`].
///
/// Returning drops `inbox`, which the client reads as the end of the session.
async fn forward_replies(
    transport_id: String,
    address: Address,
    mut consumer: Consumer,
    inbox: mpsc::Sender<Envelope>,
) {
    // ---
    use futures_lite::stream::StreamExt;

    while let Some(delivery_result) = consumer.next().await {
        let delivery = match delivery_result {
            Ok(delivery) => delivery,
            Err(_e) => {
                log_error!("[{transport_id}] consumer error on {address}: {_e}");
                break;
            }
        };

        if let Err(_e) = delivery.ack(BasicAckOptions::default()).await {
            log_warn!("[{transport_id}] failed to ack reply: {_e}");
        }

        let env = Envelope {
            address: address.clone(),
            correlation_id: delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|c| Arc::from(c.as_str())),
            reply_to: None,
            content_type: delivery
                .properties
                .content_type()
                .as_ref()
                .map(|c| Arc::from(c.as_str())),
            payload: delivery.data.into(),
        };

        if inbox.send(env).await.is_err() {
            log_debug!("[{transport_id}] reply inbox dropped, stopping consumer");
            return;
        }
    }

    log_info!("[{transport_id}] reply consumer on {address} ended");
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        self.request(|resp| Cmd::Publish { env, resp }).await
    }

    async fn declare_reply_queue(&self) -> Result<ReplyQueue> {
        self.request(|resp| Cmd::DeclareReplyQueue { resp }).await
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Cmd::Close { resp: tx }).await;
        let _ = rx.await;

        if let Some(handle) = self.actor.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// Open an AMQP connection and channel for `config.broker_uri`.
async fn create_amqp_connection(config: &RpcConfig) -> Result<(Connection, Channel)> {
    // ---
    let uri = config.broker_uri.as_str();
    log_info!("Connecting to AMQP broker: {uri}");

    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| RpcError::Connection(format!("amqp: connection failed: {e}")))?;

    let channel = connection.create_channel().await.map_err(|e| {
        RpcError::Connection(format!("amqp: channel creation failed: {e}"))
    })?;

    log_info!("Connected to AMQP broker");
    Ok((connection, channel))
}
