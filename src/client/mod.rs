// src/client/mod.rs
//! Entity-recognition RPC client.
//!
//! This module contains [`RpcClient`], which multiplexes any number of
//! concurrent prediction calls over one broker session.
//!
//! # Architecture
//!
//! - [`connection`] owns the session and its reconnect state machine.
//! - [`consumer`] drains the private reply queue for the session's lifetime.
//! - [`pending`] maps correlation ids to the result slots of calls in flight.
//! - [`publisher`] registers a call and publishes its request.
//! - [`timeout`] races each call against its deadline.
//!
//! Each call mints a fresh correlation id; replies are matched on that id
//! alone, never on publish or arrival order.
//!
//! # Concurrency
//!
//! The pending registry is the only state shared between callers and the
//! consumer task. Every transition on an entry goes through it, and the first
//! transition wins.

mod connection;
mod consumer;
mod pending;
mod publisher;
mod timeout;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

pub use connection::ConnectionState;

use connection::ConnectionManager;
use pending::PendingRegistry;

use crate::{
    // ---
    Address,
    CallContext,
    ConnectorPtr,
    EntitySpan,
    InterceptorChain,
    PredictRequest,
    Result,
    RpcConfig,
};

/// Client handle.
///
/// Cheap to clone (internally `Arc`-backed); clones share one session and
/// one pending registry.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    config: RpcConfig,
    request_queue: Address,
    pending: Arc<PendingRegistry<Vec<EntitySpan>>>,
    conn: ConnectionManager,
    interceptors: InterceptorChain,
    call_seq: AtomicU64,
}

impl RpcClient {
    // ---
    /// Create a disconnected client.
    ///
    /// Use [`RpcClientBuilder`](crate::RpcClientBuilder) to add
    /// interceptors.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation.
    pub fn new(connector: ConnectorPtr, config: RpcConfig) -> Result<Self> {
        Self::with_interceptors(connector, config, InterceptorChain::new())
    }

    pub(crate) fn with_interceptors(
        connector: ConnectorPtr,
        config: RpcConfig,
        interceptors: InterceptorChain,
    ) -> Result<Self> {
        // ---
        config.validate()?;

        let request_queue = Address::from(config.request_queue.as_str());
        let inner = Inner {
            config,
            request_queue,
            pending: Arc::new(PendingRegistry::new()),
            conn: ConnectionManager::new(connector),
            interceptors,
            call_seq: AtomicU64::new(0),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Establish the broker session and reply queue.
    ///
    /// Idempotent while connected. Also the way out of
    /// [`ConnectionState::Failed`].
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Connection`](crate::RpcError::Connection) if the
    /// broker is unreachable or rejects the session.
    pub async fn connect(&self) -> Result<()> {
        connection::connect(&self.inner).await
    }

    /// Close the session. Calls still in flight fail with
    /// [`RpcError::ConnectionLost`](crate::RpcError::ConnectionLost).
    pub async fn disconnect(&self) {
        connection::disconnect(&self.inner).await
    }

    /// Connect, run `f`, then disconnect whatever `f` returned.
    ///
    /// # Example
    ///
    /// ```
    /// use ner_rpc::{MemoryBroker, RpcClient, RpcConfig};
    /// use std::sync::Arc;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> ner_rpc::Result<()> {
    /// let broker = MemoryBroker::new();
    /// let client = RpcClient::new(Arc::new(broker), RpcConfig::memory("doc"))?;
    ///
    /// let pending = client
    ///     .run_connected(|client| async move { Ok(client.pending_count()) })
    ///     .await?;
    /// assert_eq!(pending, 0);
    /// assert!(!client.is_connected());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run_connected<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(RpcClient) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // ---
        if let Err(err) = self.connect().await {
            self.disconnect().await;
            return Err(err);
        }
        let out = f(self.clone()).await;
        self.disconnect().await;
        out
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.conn.state()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.conn.watch()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// Send one request and wait up to `timeout` for its reply.
    ///
    /// Runs through the interceptor chain. No retry happens here; calling
    /// again issues a brand-new request.
    ///
    /// # Errors
    ///
    /// - `NotConnected` / `Connection` when there is no live session
    /// - `Publish` if the request could not be handed to the broker
    /// - `Decode` if the reply was not a list of spans
    /// - `Timeout` if no reply arrived in time
    /// - `ConnectionLost` if the link dropped while waiting
    pub async fn call(&self, req: &PredictRequest, timeout: Duration) -> Result<Vec<EntitySpan>> {
        // ---
        let inner = &self.inner;
        let seq = inner.call_seq.fetch_add(1, Ordering::Relaxed);
        let ctx = CallContext::new(seq, req, timeout);

        inner
            .interceptors
            .run(&ctx, || async {
                let route = inner.conn.route()?;
                let ticket =
                    publisher::publish_request(&inner.pending, &route, &inner.request_queue, req)
                        .await?;
                timeout::await_outcome(ticket, timeout).await
            })
            .await
    }

    /// Analyze `text` with the configured default timeout.
    pub async fn predict(&self, text: &str) -> Result<Vec<EntitySpan>> {
        self.predict_with_timeout(text, self.inner.config.request_timeout)
            .await
    }

    /// Analyze `text`, failing with `Timeout` after `timeout`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use ner_rpc::RpcClient;
    /// # use std::time::Duration;
    /// # async fn example(client: RpcClient) -> ner_rpc::Result<()> {
    /// let spans = client
    ///     .predict_with_timeout("Barack Obama visited Paris", Duration::from_secs(5))
    ///     .await?;
    /// for span in spans {
    ///     println!("{}..{} {}", span.start_index, span.end_index, span.entity);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn predict_with_timeout(
        &self,
        text: &str,
        timeout: Duration,
    ) -> Result<Vec<EntitySpan>> {
        self.call(&PredictRequest::new(text), timeout).await
    }
}
