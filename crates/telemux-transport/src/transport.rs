//! Transport abstraction

use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use telemux_proto::MAX_FRAME_SIZE;
use tokio::sync::watch;

/// Duplex, message-oriented channel over one physical connection.
///
/// One frame carries one message. Deadlines of `None` or `Duration::ZERO`
/// block indefinitely.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection and start the I/O pumps. Idempotent.
    async fn start(&self) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    async fn stop(&self);

    /// Whether the connection is currently up
    fn is_running(&self) -> bool;

    /// Queue a frame for writing, waiting for queue space up to `deadline`
    async fn send_frame(&self, frame: Bytes, deadline: Option<Duration>) -> Result<(), TransportError>;

    /// Queue a frame for writing without waiting
    fn try_send_frame(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Receive the next frame, waiting up to `deadline`.
    ///
    /// [`TransportError::FrameTooLarge`] stands in for an over-limit frame
    /// and leaves the transport running.
    async fn recv_frame(&self, deadline: Option<Duration>) -> Result<Bytes, TransportError>;

    /// Frames waiting in the outbound queue
    fn outbound_len(&self) -> usize;

    /// Frames waiting in the inbound queue
    fn inbound_len(&self) -> usize;

    /// Last write-side failure
    fn send_errors(&self) -> watch::Receiver<Option<TransportError>>;

    /// Last read-side failure
    fn recv_errors(&self) -> watch::Receiver<Option<TransportError>>;
}

/// Structured (MessagePack) messages on top of any [`Transport`]
#[async_trait]
pub trait TransportExt: Transport {
    /// Encode and send one message
    async fn send_message<M>(&self, message: &M, deadline: Option<Duration>) -> Result<(), TransportError>
    where
        M: Serialize + Sync,
    {
        let bytes = rmp_serde::to_vec_named(message).map_err(|e| TransportError::Io {
            op: "encode",
            message: e.to_string(),
        })?;
        self.send_frame(bytes.into(), deadline).await
    }

    /// Receive and decode one message
    async fn recv_message<M>(&self, deadline: Option<Duration>) -> Result<M, TransportError>
    where
        M: DeserializeOwned + Send,
    {
        let frame = self.recv_frame(deadline).await?;
        rmp_serde::from_slice(&frame).map_err(|e| TransportError::Io {
            op: "decode",
            message: e.to_string(),
        })
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Capacity of the outbound frame queue
    pub outbound_queue: usize,
    /// Capacity of the inbound frame queue
    pub inbound_queue: usize,
    /// Largest frame accepted in either direction
    pub max_frame_size: usize,
    /// Bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Bound on writing a single frame; `None` waits indefinitely
    pub write_timeout: Option<Duration>,
    /// First reconnect delay
    pub retry_delay: Duration,
    /// Reconnect delay ceiling
    pub max_retry_delay: Duration,
    /// Connect attempts before giving up; 0 retries until stopped
    pub max_retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            inbound_queue: 256,
            max_frame_size: MAX_FRAME_SIZE,
            connect_timeout: Duration::from_secs(10),
            write_timeout: Some(Duration::from_secs(10)),
            retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            max_retries: 0,
        }
    }
}

impl TransportConfig {
    /// Set both queue capacities
    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.outbound_queue = size.max(1);
        self.inbound_queue = size.max(1);
        self
    }

    /// Set the maximum frame size
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the reconnect policy
    pub fn with_retry(mut self, first: Duration, ceiling: Duration, max_retries: u32) -> Self {
        self.retry_delay = first;
        self.max_retry_delay = ceiling.max(first);
        self.max_retries = max_retries;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based): doubles from
    /// `retry_delay` and never exceeds `max_retry_delay`
    pub fn retry_delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_delay
            .checked_mul(factor)
            .unwrap_or(self.max_retry_delay)
            .min(self.max_retry_delay)
    }
}

/// Treat a zero deadline as "no deadline"
pub(crate) fn effective_deadline(deadline: Option<Duration>) -> Option<Duration> {
    deadline.filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
        assert_eq!(config.max_retries, 0);
        assert!(config.outbound_queue > 0);
    }

    #[test]
    fn test_retry_delay_is_bounded() {
        let config = TransportConfig::default().with_retry(
            Duration::from_millis(100),
            Duration::from_secs(1),
            5,
        );

        assert_eq!(config.retry_delay_for(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay_for(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay_for(4), Duration::from_millis(800));
        assert_eq!(config.retry_delay_for(5), Duration::from_secs(1));
        assert_eq!(config.retry_delay_for(200), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_deadline_blocks() {
        assert_eq!(effective_deadline(Some(Duration::ZERO)), None);
        assert_eq!(effective_deadline(None), None);
        assert_eq!(
            effective_deadline(Some(Duration::from_secs(1))),
            Some(Duration::from_secs(1))
        );
    }
}
