// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the broker-facing interface used by the RPC client.
//! It intentionally avoids any reference to concrete protocols, brokers, or
//! client libraries.
//!
//! A transport is one broker session plus one channel over it. It is
//! responsible only for delivering opaque envelopes: publishing requests to
//! a named destination and receiving replies on a private reply queue.
//! Correlation, timeouts and reconnection are handled by the client layer.
//!
//! Concrete implementations of this interface live under `src/transport/`.
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{Result, RpcConfig};

/// A transport address.
///
/// An `Address` names a destination messages may be published to. For AMQP
/// it is a queue name used as routing key on the default exchange; the
/// domain layer treats it as an opaque identifier.
///
/// Addresses are immutable, cheap to clone, and safe to share across threads.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Address(value.into())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque message envelope.
///
/// An `Envelope` is the unit of transport between producers and consumers.
/// It carries a payload along with the metadata used for RPC correlation and
/// reply routing. The transport does not interpret the payload.
///
/// # Examples
///
/// ```
/// # use ner_rpc::{Envelope, Address};
/// # use bytes::Bytes;
/// # use std::sync::Arc;
/// let request = Envelope::request(
///     Address::from("model_rpc_queue"),
///     Bytes::from_static(br#"{"input":"hello"}"#),
///     Arc::from("correlation-123"),
///     Address::from("amq.gen-reply"),
///     Arc::from("application/json"),
/// );
///
/// let reply = Envelope::response(
///     Address::from("amq.gen-reply"),
///     Bytes::from_static(b"[]"),
///     Arc::from("correlation-123"),
///     Arc::from("application/json"),
/// );
/// assert_eq!(request.correlation_id, reply.correlation_id);
/// ```
#[derive(Clone, Debug)]
pub struct Envelope {
    // ---
    /// Delivery address used by the transport.
    pub address: Address,

    /// Opaque payload bytes.
    pub payload: Bytes,

    /// Correlation identifier used to associate requests with replies.
    pub correlation_id: Option<Arc<str>>,

    /// Where the worker must send its reply. Set on requests only.
    pub reply_to: Option<Address>,

    /// Optional content type metadata (e.g., "application/json").
    pub content_type: Option<Arc<str>>,
}

impl Envelope {
    // ---
    /// Create a request envelope.
    ///
    /// # Arguments
    ///
    /// * `address` - Worker-facing destination (e.g., "model_rpc_queue")
    /// * `payload` - Serialized request data
    /// * `correlation_id` - Unique identifier for matching the reply
    /// * `reply_to` - Reply queue the worker should answer on
    /// * `content_type` - Payload format (typically "application/json")
    pub fn request(
        address: Address,
        payload: Bytes,
        correlation_id: Arc<str>,
        reply_to: Address,
        content_type: Arc<str>,
    ) -> Self {
        // ---
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(content_type),
        }
    }

    /// Create a response envelope addressed to a request's `reply_to`.
    pub fn response(
        address: Address,
        payload: Bytes,
        correlation_id: Arc<str>,
        content_type: Arc<str>,
    ) -> Self {
        // ---
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: None,
            content_type: Some(content_type),
        }
    }
}

/// A private reply queue declared on a session.
///
/// The queue is exclusive to the declaring session, named by the broker, and
/// removed automatically when the session ends. Messages delivered here are
/// acknowledged by the transport exactly once, on receipt, before they reach
/// `inbox`.
///
/// `inbox` yields `None` once the session is gone, whether it was closed or
/// the link dropped.
pub struct ReplyQueue {
    // ---
    /// Broker-assigned address to put in `reply_to`.
    pub address: Address,

    /// Receiver for replies delivered to this queue.
    pub inbox: mpsc::Receiver<Envelope>,
}

/// Transport abstraction: one live broker session and channel.
///
/// Implementations must ensure that:
/// - `publish()` is safe to call concurrently from many tasks.
/// - once `declare_reply_queue()` returns, replies addressed to the returned
///   address are delivered to its inbox.
/// - the reply inbox closes when the session ends for any reason.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier of this session, used for logging.
    fn transport_id(&self) -> &str;

    /// Publish an envelope to `env.address`.
    async fn publish(&self, env: Envelope) -> Result<()>;

    /// Declare an exclusive, server-named, auto-delete reply queue and start
    /// consuming it.
    async fn declare_reply_queue(&self) -> Result<ReplyQueue>;

    /// Close the session and release any associated broker resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn Transport>`; clones share the same underlying session.
pub type TransportPtr = Arc<dyn Transport>;

/// Factory for broker sessions.
///
/// Each `connect()` opens a brand-new session; the client calls it once on
/// `connect()` and again for every reconnect attempt.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    // ---
    async fn connect(&self, config: &RpcConfig) -> Result<TransportPtr>;
}

pub type ConnectorPtr = Arc<dyn Connector>;
