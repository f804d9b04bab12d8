//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Envelope or payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid frame format
    #[error("Invalid frame format")]
    InvalidFrame,

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Data envelope declared a version this build cannot decode
    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u8),

    /// Underlying stream failed while reading or writing a frame
    #[error("{op} failed: {source}")]
    Io {
        /// Operation that failed
        op: &'static str,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Encode(format!("MessagePack encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Decode(format!("MessagePack decode error: {}", err))
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(format!("JSON error: {}", err))
    }
}
