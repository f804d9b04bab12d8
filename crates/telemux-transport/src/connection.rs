//! Connection establishment and retry

use crate::{TransportConfig, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Byte stream a transport can run over
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed byte stream
pub type BoxedIo = Box<dyn AsyncIo>;

/// Opens new connections for a transport that is allowed to reconnect
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one connection
    async fn connect(&self) -> Result<BoxedIo, TransportError>;

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;
}

/// TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    /// `host:port` to dial
    addr: String,
    /// Disable Nagle's algorithm
    nodelay: bool,
}

impl TcpConnector {
    /// Create a connector for `addr`
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            nodelay: true,
        }
    }

    /// Toggle `TCP_NODELAY`
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedIo, TransportError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to connect to {}: {}", self.addr, e)))?;
        stream
            .set_nodelay(self.nodelay)
            .map_err(|e| TransportError::from_io("set_nodelay", e))?;
        debug!("Connected to {}", self.addr);
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        self.addr.clone()
    }
}

/// Connect with bounded, exponentially growing retry delay.
///
/// Gives up after `config.max_retries` attempts (0 = never) or once `cancelled`
/// is set.
pub async fn connect_with_retries(
    connector: &dyn Connector,
    config: &TransportConfig,
    cancelled: &AtomicBool,
) -> Result<BoxedIo, TransportError> {
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        if cancelled.load(Ordering::Acquire) {
            return Err(TransportError::NotRunning);
        }

        debug!("Connection attempt {} to {}", attempt, connector.endpoint());

        let error = match timeout(config.connect_timeout, connector.connect()).await {
            Ok(Ok(io)) => {
                info!("Connected to {} on attempt {}", connector.endpoint(), attempt);
                return Ok(io);
            }
            Ok(Err(e)) => e,
            Err(_) => TransportError::Timeout,
        };

        warn!("Connection attempt {} to {} failed: {}", attempt, connector.endpoint(), error);

        if config.max_retries != 0 && attempt >= config.max_retries {
            return Err(error);
        }

        sleep(config.retry_delay_for(attempt)).await;
    }
}
