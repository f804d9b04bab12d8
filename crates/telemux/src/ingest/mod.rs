//! Streaming ingestion sessions
//!
//! Data and log streams read frames straight off their own transport; they
//! do not go through a [`Multiplexer`](crate::Multiplexer). Each loop runs
//! until the agent closes the stream or a fatal error ends the session; the
//! caller owns reconnection.

mod data;
mod logs;

pub use data::run_data_loop;
pub use logs::run_log_loop;

use std::time::Duration;

/// Data-loop settings
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// How long to wait for the next frame before ending the session
    pub recv_timeout: Duration,
    /// Largest report payload accepted; bigger ones are dropped unacknowledged
    pub max_payload: usize,
    /// Frames accepted per session before the agent is throttled
    pub throttle_after: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(30),
            max_payload: 10 * 1024 * 1024,
            throttle_after: 10_000,
        }
    }
}

/// Log-loop settings
#[derive(Debug, Clone)]
pub struct LogIngestConfig {
    /// Entries per batch write
    pub batch_size: usize,
    /// Flush a partial batch this often
    pub flush_interval: Duration,
    /// Pause after the store reports itself read-only
    pub read_only_backoff: Duration,
}

impl Default for LogIngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            read_only_backoff: Duration::from_secs(1),
        }
    }
}
