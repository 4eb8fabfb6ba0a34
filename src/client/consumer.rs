//! Reply channel consumer.
//!
//! One task per session drains the reply queue for as long as the session
//! lives, whether or not any call is pending. Acknowledgement already
//! happened inside the transport, so nothing here can cause redelivery.
//!
//! When the inbox closes without the client having asked for it, the task
//! reports a lost link to the connection manager.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::pending::PendingRegistry;
use super::Inner;
use crate::{decode_response, CorrelationId, EntitySpan, Envelope};

/// Spawn the consumer for the session with the given generation.
pub(super) fn spawn(
    inner: Weak<Inner>,
    generation: u64,
    mut inbox: mpsc::Receiver<Envelope>,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        while let Some(env) = inbox.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            handle_reply(&inner.pending, env);
        }

        crate::log_debug!("reply inbox closed (session {generation})");
        if let Some(inner) = inner.upgrade() {
            super::connection::link_lost(&inner, generation);
        }
    })
}

/// Route one reply to its pending call.
pub(crate) fn handle_reply(pending: &Arc<PendingRegistry<Vec<EntitySpan>>>, env: Envelope) {
    // ---
    let Some(raw) = env.correlation_id else {
        crate::log_warn!("dropping reply on {} without correlation id", env.address);
        return;
    };
    let token = CorrelationId::from(raw);

    // Cheap pre-check so late replies are not decoded for nothing. The
    // registry still arbitrates below.
    if !pending.contains(&token) {
        crate::log_debug!("dropping reply for unknown or settled {token}");
        return;
    }

    match decode_response(&env.payload) {
        Ok(spans) => {
            if !pending.resolve(&token, spans) {
                crate::log_debug!("reply for {token} lost the race, dropped");
            }
        }
        Err(err) => {
            crate::log_warn!("undecodable reply for {token}: {err}");
            pending.fail(&token, err);
        }
    }
}
