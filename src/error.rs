use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during RPC operations.
///
/// Every call-scoped variant (`Publish`, `Decode`, `Timeout`,
/// `ConnectionLost`) is delivered only to the call that produced it; sibling
/// in-flight calls are never affected.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Broker unreachable, session rejected, or the client is between
    /// sessions (reconnecting or failed).
    #[error("connection error: {0}")]
    Connection(String),

    /// A call was attempted before `connect()` or after `disconnect()`.
    #[error("not connected to broker, call connect() first")]
    NotConnected,

    /// The broker link dropped while the call was in flight.
    #[error("connection lost while request was in flight")]
    ConnectionLost,

    /// The encoded request could not be handed to the broker.
    #[error("publish failed: {0}")]
    Publish(String),

    /// A reply arrived but could not be parsed into the expected shape.
    #[error("failed to decode reply: {0}")]
    Decode(String),

    /// No reply arrived before the deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The pending registry already holds an entry for this correlation id.
    #[error("duplicate correlation id: {0}")]
    DuplicateCorrelation(String),

    /// The caller abandoned the call before it completed.
    #[error("call cancelled by caller")]
    Cancelled,

    /// Rejected by an in-flight limit before publishing.
    #[error("too many requests in flight (limit {limit})")]
    Overloaded { limit: usize },

    /// JSON encoding of a request failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport-internal failure (actor gone, channel closed, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// Required configuration value is missing.
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    /// Mutually exclusive configuration options were combined.
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    /// A configuration value could not be parsed or is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RpcError {
    /// Whether the reconnect loop should try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Connection(_) | RpcError::Transport(_))
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
