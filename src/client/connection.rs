//! Connection manager.
//!
//! Owns the broker session (transport + reply queue + consumer task) and the
//! connection state machine:
//!
//! ```text
//! Disconnected ──connect()──▶ Connected ──link drop──▶ Reconnecting{n}
//!      ▲                         ▲                        │      │
//!      └──────disconnect()───────┴────────── success ◀────┘      ▼
//!                                                              Failed
//! ```
//!
//! Every pending call is failed with [`RpcError::ConnectionLost`] when the
//! link drops or the client disconnects.
//!
//! # Locking
//!
//! - `lifecycle` (async) serializes `connect()` and `disconnect()` against
//!   each other across their awaits.
//! - `slot` (sync, never held across an await) guards the live session, the
//!   reconnect task handle and every state transition. Link loss and
//!   reconnect installs only ever take `slot`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{consumer, Inner};
use crate::retry::retry_with_backoff;
use crate::{Address, ConnectorPtr, ReplyQueue, Result, RpcError, TransportPtr};

/// Observable connection state of an [`RpcClient`](crate::RpcClient).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session; calls fail with [`RpcError::NotConnected`].
    Disconnected,
    /// Session and reply queue are live.
    Connected,
    /// The link dropped and a background task is re-establishing it.
    Reconnecting { attempt: u32 },
    /// Reconnection was disabled or gave up; `connect()` starts over.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::Failed => f.write_str("failed"),
        }
    }
}

/// What a call needs from the live session.
pub(crate) struct Route {
    pub(crate) transport: TransportPtr,
    pub(crate) reply_to: Address,
}

/// One established broker session.
///
/// Dropping it stops the consumer; the transport releases broker resources
/// once its last handle is gone.
pub(crate) struct Session {
    generation: u64,
    transport: TransportPtr,
    reply_to: Address,
    consumer: JoinHandle<()>,
}

impl Session {
    async fn close(self) {
        // ---
        self.consumer.abort();
        if let Err(_err) = self.transport.close().await {
            crate::log_warn!("[{}] close failed: {_err}", self.transport.transport_id());
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.consumer.abort();
    }
}

#[derive(Default)]
struct Slot {
    session: Option<Session>,
    reconnect: Option<JoinHandle<()>>,
}

impl Slot {
    fn abort_reconnect(&mut self) {
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
    }
}

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) struct ConnectionManager {
    // ---
    connector: ConnectorPtr,
    lifecycle: tokio::sync::Mutex<()>,
    slot: Mutex<Slot>,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
}

impl ConnectionManager {
    pub(crate) fn new(connector: ConnectorPtr) -> Self {
        // ---
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            lifecycle: tokio::sync::Mutex::new(()),
            slot: Mutex::new(Slot::default()),
            state,
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The live session's transport and reply address.
    ///
    /// # Errors
    ///
    /// [`RpcError::NotConnected`] before `connect()` or after
    /// `disconnect()`; [`RpcError::Connection`] while reconnecting or failed.
    pub(crate) fn route(&self) -> Result<Route> {
        // ---
        let slot = lock_ignore_poison(&self.slot);

        if let Some(session) = &slot.session {
            return Ok(Route {
                transport: Arc::clone(&session.transport),
                reply_to: session.reply_to.clone(),
            });
        }

        match self.state() {
            ConnectionState::Reconnecting { attempt } => Err(RpcError::Connection(format!(
                "broker link down, reconnecting (attempt {attempt})"
            ))),
            ConnectionState::Failed => Err(RpcError::Connection(
                "broker link failed, call connect() to retry".into(),
            )),
            ConnectionState::Disconnected | ConnectionState::Connected => {
                Err(RpcError::NotConnected)
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        // ---
        let prev = self.state.send_replace(next);
        if prev != next {
            crate::log_debug!("connection state {prev} -> {next}");
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        lock_ignore_poison(&self.slot).abort_reconnect();
    }
}

fn connection_error(err: RpcError) -> RpcError {
    match err {
        RpcError::Connection(msg) => RpcError::Connection(msg),
        other => RpcError::Connection(other.to_string()),
    }
}

/// A broker session whose reply queue is declared but not yet consumed.
struct Opened {
    generation: u64,
    transport: TransportPtr,
    reply: ReplyQueue,
}

impl Opened {
    /// Start consuming replies and make this the live session.
    ///
    /// Must run under the `slot` lock: the consumer reports a closed inbox
    /// through `link_lost`, which then always finds this session installed,
    /// even when the link died before installation.
    fn install(self, inner: &Arc<Inner>, slot: &mut Slot) {
        // ---
        let Opened {
            generation,
            transport,
            reply,
        } = self;

        let consumer = consumer::spawn(Arc::downgrade(inner), generation, reply.inbox);

        crate::log_info!(
            "[{}] session {generation} up, replies on {}",
            transport.transport_id(),
            reply.address
        );

        slot.session = Some(Session {
            generation,
            transport,
            reply_to: reply.address,
            consumer,
        });
        inner.conn.set_state(ConnectionState::Connected);
    }
}

/// Open a session and declare its reply queue.
async fn establish(inner: &Arc<Inner>) -> Result<Opened> {
    // ---
    let conn = &inner.conn;

    let transport = conn
        .connector
        .connect(&inner.config)
        .await
        .map_err(connection_error)?;

    let reply = match transport.declare_reply_queue().await {
        Ok(reply) => reply,
        Err(err) => {
            let _ = transport.close().await;
            return Err(connection_error(err));
        }
    };

    Ok(Opened {
        generation: conn.next_generation(),
        transport,
        reply,
    })
}

/// Establish a session unless one is already live.
///
/// An explicit connect supersedes any background reconnection.
pub(super) async fn connect(inner: &Arc<Inner>) -> Result<()> {
    // ---
    let conn = &inner.conn;
    let _lifecycle = conn.lifecycle.lock().await;

    {
        let mut slot = lock_ignore_poison(&conn.slot);
        if slot.session.is_some() {
            return Ok(());
        }
        slot.abort_reconnect();
        if matches!(conn.state(), ConnectionState::Reconnecting { .. }) {
            conn.set_state(ConnectionState::Disconnected);
        }
    }

    let opened = establish(inner).await.inspect_err(|_err| {
        crate::log_error!("connect to {} failed: {_err}", inner.config.broker_uri);
    })?;

    let mut slot = lock_ignore_poison(&conn.slot);
    opened.install(inner, &mut slot);
    Ok(())
}

/// Tear down the session and fail every pending call.
///
/// Safe to call in any state; stops a running reconnect loop.
pub(super) async fn disconnect(inner: &Arc<Inner>) {
    // ---
    let conn = &inner.conn;
    let _lifecycle = conn.lifecycle.lock().await;

    let session = {
        let mut slot = lock_ignore_poison(&conn.slot);
        slot.abort_reconnect();
        conn.set_state(ConnectionState::Disconnected);
        slot.session.take()
    };

    let failed = inner.pending.fail_all(|| RpcError::ConnectionLost);
    if failed > 0 {
        crate::log_warn!("disconnect failed {failed} pending call(s)");
    }

    if let Some(session) = session {
        let _generation = session.generation;
        session.close().await;
        crate::log_info!("session {_generation} closed");
    }
}

/// Called by the consumer of session `generation` when its inbox closes.
///
/// Ignored unless that session is still the live one.
pub(super) fn link_lost(inner: &Arc<Inner>, generation: u64) {
    // ---
    let conn = &inner.conn;
    let policy = &inner.config.reconnect;

    let stale = {
        let mut slot = lock_ignore_poison(&conn.slot);

        match &slot.session {
            Some(session) if session.generation == generation => {}
            _ => return,
        }
        let Some(stale) = slot.session.take() else {
            return;
        };

        if policy.enabled {
            conn.set_state(ConnectionState::Reconnecting { attempt: 1 });
            slot.abort_reconnect();
            slot.reconnect = Some(spawn_reconnect(inner, stale));
            None
        } else {
            conn.set_state(ConnectionState::Failed);
            Some(stale)
        }
    };

    let failed = inner.pending.fail_all(|| RpcError::ConnectionLost);
    crate::log_warn!("broker link lost (session {generation}), failed {failed} pending call(s)");

    if let Some(stale) = stale {
        crate::log_error!("reconnect disabled, client is now failed");
        tokio::spawn(stale.close());
    }
}

fn spawn_reconnect(inner: &Arc<Inner>, stale: Session) -> JoinHandle<()> {
    // ---
    let weak = Arc::downgrade(inner);
    let policy = inner.config.reconnect.clone();

    tokio::spawn(async move {
        stale.close().await;

        let outcome = retry_with_backoff(&policy, |attempt| {
            let weak = weak.clone();
            async move {
                // Client dropped: a non-retryable error ends the loop.
                let inner = weak.upgrade().ok_or(RpcError::NotConnected)?;
                let conn = &inner.conn;

                {
                    let _slot = lock_ignore_poison(&conn.slot);
                    if !matches!(conn.state(), ConnectionState::Reconnecting { .. }) {
                        return Err(RpcError::NotConnected);
                    }
                    conn.set_state(ConnectionState::Reconnecting { attempt });
                }

                let opened = establish(&inner).await?;

                let mut slot = lock_ignore_poison(&conn.slot);
                if !matches!(conn.state(), ConnectionState::Reconnecting { .. }) {
                    return Err(RpcError::NotConnected);
                }
                opened.install(&inner, &mut slot);
                crate::log_info!("reconnected after {attempt} attempt(s)");
                Ok::<(), RpcError>(())
            }
        })
        .await;

        if let Err(err) = outcome {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let conn = &inner.conn;
            let _slot = lock_ignore_poison(&conn.slot);
            if matches!(conn.state(), ConnectionState::Reconnecting { .. }) {
                conn.set_state(ConnectionState::Failed);
                crate::log_error!("giving up on broker after {} attempt(s): {err}", policy.max_attempts);
            }
        }
    })
}
