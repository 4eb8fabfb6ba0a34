//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Connector` and `Transport` traits. Broker-backed transports are hidden
//! behind feature flags; the in-memory broker is always available.
//!
//! Client code must not depend on transport-specific types.

mod amqp;
mod memory;

pub use memory::MemoryBroker;

#[cfg(feature = "transport_lapin")]
pub use amqp::AmqpConnector;
