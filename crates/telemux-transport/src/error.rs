//! Transport error types

use std::io;
use telemux_proto::ProtocolError;
use thiserror::Error;

/// Transport-specific errors.
///
/// [`TransportError::StreamClosed`] is the expected end of a session and is
/// compared directly, never wrapped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Deadline expired before the operation completed
    #[error("Operation timed out")]
    Timeout,

    /// Peer closed the stream
    #[error("Stream closed")]
    StreamClosed,

    /// Transport has not been started or has been stopped
    #[error("Transport not running")]
    NotRunning,

    /// Outbound queue is full
    #[error("Outbound queue full")]
    QueueFull,

    /// Peer sent a frame over the size limit. Its body was skipped and the
    /// stream is still usable.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Declared frame size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Could not establish a connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Any other failure, tagged with the operation that failed
    #[error("{op} failed: {message}")]
    Io {
        /// Failing operation
        op: &'static str,
        /// Error detail
        message: String,
    },
}

impl TransportError {
    /// Normalize an I/O error raised by `op`
    pub fn from_io(op: &'static str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::UnexpectedEof => Self::StreamClosed,
            _ => Self::Io {
                op,
                message: err.to_string(),
            },
        }
    }

    /// Normalize a codec error raised by `op`
    pub fn from_protocol(op: &'static str, err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io { op, source } => Self::from_io(op, source),
            ProtocolError::FrameTooLarge { size, max } => Self::FrameTooLarge { size, max },
            other => Self::Io {
                op,
                message: other.to_string(),
            },
        }
    }

    /// Whether this is the expected end of a session
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::StreamClosed)
    }
}
