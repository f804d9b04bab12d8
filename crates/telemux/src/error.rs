//! Error types for the telemux core

use std::fmt;
use std::time::Duration;
use telemux_proto::{AgentId, CorrelationId, ProtocolError};
use telemux_transport::TransportError;
use thiserror::Error;

/// Session errors returned to a single `send` caller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    /// Multiplexer was never started
    #[error("Multiplexer not running")]
    NotRunning,

    /// Multiplexer was stopped before the call completed
    #[error("Multiplexer stopped")]
    Stopped,

    /// Request queue stayed full for the whole submit window
    #[error("Timed out after {duration:?} submitting request")]
    SendTimeout {
        /// Submit window that was exceeded
        duration: Duration,
    },

    /// No reply arrived within the reply window
    #[error("Timed out after {duration:?} waiting for reply")]
    RecvTimeout {
        /// Reply window that was exceeded
        duration: Duration,
    },

    /// Processor refused to encode the request
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Invalid construction parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport failure while starting the session
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors raised by a [`Processor`](crate::Processor)
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Reply does not match any outstanding command
    #[error("Reply for unknown command {0}")]
    UnknownReply(CorrelationId),

    /// A command with this ID is already waiting for its reply
    #[error("Command {0} already outstanding")]
    DuplicateId(CorrelationId),

    /// Envelope could not be encoded or decoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Side effect failed to persist
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration store failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Store has no record of the agent
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    /// Backend failure
    #[error("Storage error: {0}")]
    Backend(String),
}

/// Class of a persistent-writer failure; decides abort vs. continue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
    /// Storage unreachable
    Network,
    /// Storage refuses writes
    ReadOnly,
    /// Anything else, typically a duplicate-delivery conflict
    Other,
}

impl fmt::Display for WriteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => f.write_str("network"),
            Self::ReadOnly => f.write_str("read-only"),
            Self::Other => f.write_str("other"),
        }
    }
}

/// Persistent-writer failure, pre-classified by the writer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} write failure: {message}")]
pub struct WriteError {
    /// Failure class
    pub kind: WriteErrorKind,
    /// Detail
    pub message: String,
}

impl WriteError {
    /// Storage unreachable
    pub fn network(message: impl Into<String>) -> Self {
        Self { kind: WriteErrorKind::Network, message: message.into() }
    }

    /// Storage refuses writes
    pub fn read_only(message: impl Into<String>) -> Self {
        Self { kind: WriteErrorKind::ReadOnly, message: message.into() }
    }

    /// Any other failure
    pub fn other(message: impl Into<String>) -> Self {
        Self { kind: WriteErrorKind::Other, message: message.into() }
    }
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// A live communicator is already registered for this agent
    #[error("Agent {0} is already connected")]
    DuplicateAgent(AgentId),
}

/// Fatal ingestion-loop errors; the caller restarts the session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    /// Transport failed (other than a clean end of stream)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Writer failure classified as session-fatal
    #[error("Write error: {0}")]
    Write(#[from] WriteError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_error_display() {
        let err = WriteError::read_only("replica in recovery");
        assert_eq!(err.kind, WriteErrorKind::ReadOnly);
        assert_eq!(err.to_string(), "read-only write failure: replica in recovery");
    }

    #[test]
    fn test_transport_error_converts() {
        let err: MuxError = TransportError::StreamClosed.into();
        assert_eq!(err, MuxError::Transport(TransportError::StreamClosed));

        let err: IngestError = WriteError::network("connection refused").into();
        assert!(matches!(err, IngestError::Write(WriteError { kind: WriteErrorKind::Network, .. })));
    }
}
