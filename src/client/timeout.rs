//! Timeout guard.
//!
//! Races a pending call's outcome against its deadline. When the deadline
//! fires the guard asks the registry to remove the entry; only if that
//! removal succeeds is the call reported as timed out. A failed removal
//! means some other transition won, and its outcome is already waiting in
//! the ticket's receiver.

use std::time::Duration;

use tokio::sync::oneshot::error::TryRecvError;
use tokio::time;

use super::pending::PendingTicket;
use crate::{Result, RpcError};

/// Wait for `ticket` to resolve, giving up after `deadline`.
pub(crate) async fn await_outcome<T>(mut ticket: PendingTicket<T>, deadline: Duration) -> Result<T> {
    // ---
    match time::timeout(deadline, &mut ticket.rx).await {
        Ok(Ok(outcome)) => outcome,

        // Slot dropped without a value: the registry itself went away.
        Ok(Err(_)) => Err(RpcError::ConnectionLost),

        Err(_) => settle_after_deadline(&mut ticket, deadline),
    }
}

/// Decide the outcome once `deadline` has elapsed.
///
/// Only a successful removal counts as a timeout. Otherwise another
/// transition won, and it delivered under the registry lock, so its outcome
/// is already in the receiver.
fn settle_after_deadline<T>(ticket: &mut PendingTicket<T>, deadline: Duration) -> Result<T> {
    // ---
    if ticket.registry().remove(&ticket.token) {
        crate::log_debug!("{} timed out after {deadline:?}", ticket.token);
        return Err(RpcError::Timeout(deadline));
    }

    match ticket.rx.try_recv() {
        Ok(outcome) => outcome,
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => Err(RpcError::Timeout(deadline)),
    }
}
