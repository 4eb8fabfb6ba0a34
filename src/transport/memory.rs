//! In-memory broker.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Connector` and `Transport` traits. It is intended for tests, local runs
//! and as the reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! Other transports are expected to approximate this behavior as closely as
//! their broker allows:
//!
//! - Publishing routes by exact queue name, like the AMQP default exchange.
//!   A message for a queue nobody consumes is dropped silently.
//! - A queue with several consumers fans each message out to all of them.
//! - Reply queues are server-named (`amq.gen-...`), owned by the session
//!   that declared them and removed when that session closes or is dropped.
//! - When a session ends, for whatever reason, the inboxes of its reply
//!   queues close.
//!
//! ## Fault injection
//!
//! [`MemoryBroker::refuse_connections`], [`MemoryBroker::fail_publishes`]
//! and [`MemoryBroker::sever_links`] simulate an unreachable broker, a
//! rejecting channel and a network drop respectively.
//! [`MemoryBroker::sever_after_declare`] drops each session right after its
//! reply queue is declared, so the client receives an already closed inbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    // ---
    log_debug,
    Address,
    Connector,
    Envelope,
    ReplyQueue,
    Result,
    RpcConfig,
    RpcError,
    Transport,
    TransportPtr,
};

const INBOX_CAPACITY: usize = 64;

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-process message broker.
///
/// Cheap to clone; clones share the same queues and sessions. Pass it to the
/// client as its [`Connector`] and drive the worker side with
/// [`consume`](Self::consume) and [`publish`](Self::publish).
///
/// ```
/// use ner_rpc::{Address, Envelope, MemoryBroker};
/// use bytes::Bytes;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let broker = MemoryBroker::new();
/// let mut worker = broker.consume("model_rpc_queue");
///
/// broker
///     .publish(Envelope::response(
///         Address::from("model_rpc_queue"),
///         Bytes::from_static(b"[]"),
///         Arc::from("c-1"),
///         Arc::from("application/json"),
///     ))
///     .await;
///
/// let env = worker.recv().await.unwrap();
/// assert_eq!(env.correlation_id.as_deref(), Some("c-1"));
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    // ---
    queues: Mutex<HashMap<String, Vec<mpsc::Sender<Envelope>>>>,
    sessions: Mutex<HashMap<u64, Weak<MemoryTransport>>>,
    next_session: AtomicU64,
    refuse_connections: AtomicBool,
    fail_publishes: AtomicBool,
    sever_after_declare: AtomicBool,
}

impl BrokerInner {
    /// Deliver to every live consumer of `env.address`.
    async fn route(&self, env: Envelope) {
        // ---
        let senders: Vec<mpsc::Sender<Envelope>> = {
            let mut queues = lock_ignore_poison(&self.queues);
            let name = env.address.as_str();

            let Some(consumers) = queues.get_mut(name) else {
                log_debug!("no queue {name}, message dropped");
                return;
            };
            consumers.retain(|tx| !tx.is_closed());
            if consumers.is_empty() {
                queues.remove(name);
                log_debug!("no consumers on {name}, message dropped");
                return;
            }
            consumers.clone()
        };

        for sender in senders {
            // A closed inbox means its consumer went away mid-delivery.
            let _ = sender.send(env.clone()).await;
        }
    }

    fn bind(&self, name: &str) -> mpsc::Receiver<Envelope> {
        // ---
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        lock_ignore_poison(&self.queues)
            .entry(name.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn unbind(&self, names: &[String]) {
        // ---
        let mut queues = lock_ignore_poison(&self.queues);
        for name in names {
            queues.remove(name);
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a consumer to the named queue, creating the queue if needed.
    ///
    /// The returned receiver yields every message published to `queue` from
    /// now on. Dropping it detaches the consumer.
    pub fn consume(&self, queue: &str) -> mpsc::Receiver<Envelope> {
        log_debug!("consumer attached to {queue}");
        self.inner.bind(queue)
    }

    /// Publish on behalf of a worker (or any non-client party).
    pub async fn publish(&self, env: Envelope) {
        self.inner.route(env).await;
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock_ignore_poison(&self.inner.queues).contains_key(name)
    }

    pub fn queue_count(&self) -> usize {
        lock_ignore_poison(&self.inner.queues).len()
    }

    /// Make subsequent `connect()` calls fail with a connection error.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make client publishes fail until reset.
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Sever each session as soon as it has declared a reply queue.
    pub fn sever_after_declare(&self, sever: bool) {
        self.inner.sever_after_declare.store(sever, Ordering::SeqCst);
    }

    /// Drop every live session as a network failure would.
    ///
    /// Returns the number of sessions severed.
    pub fn sever_links(&self) -> usize {
        // ---
        let live: Vec<Arc<MemoryTransport>> = lock_ignore_poison(&self.inner.sessions)
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        for session in &live {
            session.shutdown();
        }
        live.len()
    }

    /// Number of sessions currently open.
    pub fn connection_count(&self) -> usize {
        lock_ignore_poison(&self.inner.sessions)
            .values()
            .filter(|s| s.strong_count() > 0)
            .count()
    }
}

#[async_trait::async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, config: &RpcConfig) -> Result<TransportPtr> {
        // ---
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(RpcError::Connection("memory broker refused connection".into()));
        }

        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(MemoryTransport {
            id,
            transport_id: format!("{}#{id}", config.transport_id),
            broker: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
            owned_queues: Mutex::new(Vec::new()),
        });

        lock_ignore_poison(&self.inner.sessions).insert(id, Arc::downgrade(&session));
        log_debug!("{}: session opened", session.transport_id);

        Ok(session)
    }
}

/// One client session on a [`MemoryBroker`].
struct MemoryTransport {
    // ---
    id: u64,
    transport_id: String,
    broker: Arc<BrokerInner>,
    closed: AtomicBool,
    owned_queues: Mutex<Vec<String>>,
}

impl MemoryTransport {
    /// Release the session's queues and deregister it. Idempotent.
    fn shutdown(&self) {
        // ---
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let owned = std::mem::take(&mut *lock_ignore_poison(&self.owned_queues));
        self.broker.unbind(&owned);
        lock_ignore_poison(&self.broker.sessions).remove(&self.id);

        log_debug!("{}: session closed, released {} queue(s)", self.transport_id, owned.len());
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Transport(format!("{}: session closed", self.transport_id)));
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        // ---
        self.ensure_open()?;
        if self.broker.fail_publishes.load(Ordering::SeqCst) {
            return Err(RpcError::Publish("memory broker rejected publish".into()));
        }

        self.broker.route(env).await;
        Ok(())
    }

    async fn declare_reply_queue(&self) -> Result<ReplyQueue> {
        // ---
        self.ensure_open()?;

        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        let inbox = self.broker.bind(&name);
        lock_ignore_poison(&self.owned_queues).push(name.clone());

        // Closed concurrently: do not leak the queue.
        if self.closed.load(Ordering::SeqCst) {
            self.broker.unbind(std::slice::from_ref(&name));
            return Err(RpcError::Transport(format!("{}: session closed", self.transport_id)));
        }

        log_debug!("{}: declared {name}", self.transport_id);
        if self.broker.sever_after_declare.load(Ordering::SeqCst) {
            self.shutdown();
        }
        Ok(ReplyQueue {
            address: Address::from(name),
            inbox,
        })
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}
