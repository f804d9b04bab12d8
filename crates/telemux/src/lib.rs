//! # Telemux
//!
//! Agent communication for a database-telemetry server.
//!
//! Every connected collection agent gets one [`Communicator`]: a
//! [`Multiplexer`] that lets many local callers share the agent's single
//! duplex connection, driven by an [`AgentProcessor`] that correlates replies
//! with commands and applies their effects to a [`ConfigStore`]. A
//! [`Directory`] keeps track of connected agents. Report and log streams are
//! consumed by the ingestion loops in [`ingest`].

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use telemux_proto as proto;
pub use telemux_transport as transport;

/// Error types for the telemux core
pub mod error;

/// Per-session processing strategy
pub mod processor;

/// Request/reply multiplexing over one transport
pub mod multiplexer;

/// Command/reply processor for agent sessions
pub mod agent;

/// Caller-facing agent handle
pub mod communicator;

/// Persistence seams
pub mod store;

/// Registry of connected agents
pub mod directory;

/// Streaming data and log ingestion
pub mod ingest;

pub use agent::AgentProcessor;
pub use communicator::{AgentCommunicator, Communicator};
pub use directory::{AgentFinder, Directory, Sweep};
pub use error::{DirectoryError, IngestError, MuxError, ProcessError, StoreError, WriteError, WriteErrorKind};
pub use ingest::{run_data_loop, run_log_loop, IngestConfig, LogIngestConfig};
pub use multiplexer::{MuxConfig, Multiplexer};
pub use processor::{Processor, Received};
pub use store::{ConfigStore, LogWriter, ReportWriter};

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, MuxError>;
