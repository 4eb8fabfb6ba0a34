//! Entity-recognition RPC over a message broker.
//!
//! This library lets a gateway forward text to a remote prediction worker
//! through a broker and get back labeled spans. Many concurrent calls share
//! one broker session; each reply is matched to its call by correlation id
//! alone.
//!
//! - [`RpcClient`] issues calls and owns the session lifecycle.
//! - [`Connector`] / [`Transport`] abstract the broker; [`MemoryBroker`] is
//!   the in-process reference implementation and `AmqpConnector`
//!   (feature `transport_lapin`) talks to RabbitMQ.
//! - [`Interceptor`]s run around every call in a fixed order.
//!
//! ```
//! use ner_rpc::{MemoryBroker, RpcClient, RpcConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ner_rpc::Result<()> {
//! let broker = MemoryBroker::new();
//! let client = RpcClient::new(Arc::new(broker.clone()), RpcConfig::memory("gateway"))?;
//!
//! client.connect().await?;
//! assert!(client.is_connected());
//! assert_eq!(broker.connection_count(), 1);
//!
//! client.disconnect().await;
//! assert_eq!(broker.connection_count(), 0);
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod client;
mod client_builder;
mod correlation;
mod domain;
mod error;
mod interceptor;
mod macros;
mod protocol;
mod retry;
mod rpc_config;
mod transport;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use client::{ConnectionState, RpcClient};
pub use client_builder::RpcClientBuilder;

pub use correlation::CorrelationId;
pub use error::{Result, RpcError};

pub use interceptor::{CallContext, InFlightLimit, Interceptor, InterceptorChain, TimingInterceptor};

pub use protocol::{
    //
    decode_request,
    decode_response,
    encode_request,
    encode_response,
    EntitySpan,
    PredictRequest,
    CONTENT_TYPE_JSON,
};

pub use retry::ReconnectPolicy;
pub use rpc_config::{RpcConfig, DEFAULT_BROKER_URI, DEFAULT_REQUEST_QUEUE, DEFAULT_REQUEST_TIMEOUT};

pub use transport::MemoryBroker;

#[cfg(feature = "transport_lapin")]
pub use transport::AmqpConnector;

// --- public re-exports
pub use domain::{
    //
    Address,
    Connector,
    ConnectorPtr,
    Envelope,
    ReplyQueue,
    Transport,
    TransportPtr,
};
