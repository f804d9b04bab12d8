//! # Telemux Protocol
//!
//! Wire envelopes and the frame codec spoken between the telemetry server and its
//! collection agents.

#![warn(missing_docs)]

/// Command/reply envelopes and identifiers
pub mod message;

/// Data, log and ack envelopes for streaming ingestion
pub mod ingest;

/// Frame codec for async streams
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use ingest::{Ack, DataEnvelope, LogEntry, LogLevel, QueryClass, Report, ReportV1};
pub use message::{verb, AgentId, Command, CorrelationId, Reply, ServiceConfig, VersionInfo};
