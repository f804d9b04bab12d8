//! # Telemux Transport
//!
//! Duplex, message-framed transport between the telemetry server and one agent.

#![warn(missing_docs)]

/// Transport abstraction and configuration
pub mod transport;

/// Connectors and reconnect backoff
pub mod connection;

/// Framed transport over a byte stream
pub mod stream;

/// Transport error types
pub mod error;

pub use connection::{connect_with_retries, AsyncIo, BoxedIo, Connector, TcpConnector};
pub use error::TransportError;
pub use stream::StreamTransport;
pub use transport::{Transport, TransportConfig, TransportExt};
