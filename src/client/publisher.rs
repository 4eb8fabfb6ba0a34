//! Request publisher.
//!
//! Registers the call before publishing so a fast reply always finds its
//! entry, then hands the encoded request to the transport. A request that
//! never reached the broker can never be answered, so a publish failure
//! removes the entry on the spot.

use std::sync::Arc;

use super::connection::Route;
use super::pending::{PendingRegistry, PendingTicket};
use crate::{
    // ---
    encode_request,
    Address,
    CorrelationId,
    Envelope,
    PredictRequest,
    Result,
    RpcError,
    CONTENT_TYPE_JSON,
};

/// Publish `req` to `destination` and return the ticket to await its reply.
pub(crate) async fn publish_request<T>(
    pending: &Arc<PendingRegistry<T>>,
    route: &Route,
    destination: &Address,
    req: &PredictRequest,
) -> Result<PendingTicket<T>> {
    // ---
    let payload = encode_request(req)?;

    let token = CorrelationId::generate();
    let ticket = pending.register(token.clone())?;

    let env = Envelope::request(
        destination.clone(),
        payload,
        token.to_shared(),
        route.reply_to.clone(),
        Arc::from(CONTENT_TYPE_JSON),
    );

    if let Err(err) = route.transport.publish(env).await {
        pending.remove(&token);
        crate::log_warn!("publish of {token} to {destination} failed: {err}");
        return Err(match err {
            RpcError::Publish(msg) => RpcError::Publish(msg),
            other => RpcError::Publish(other.to_string()),
        });
    }

    crate::log_debug!("published {token} to {destination}, reply_to {}", route.reply_to);
    Ok(ticket)
}
