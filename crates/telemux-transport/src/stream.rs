//! Framed duplex transport over a byte stream

use crate::connection::{connect_with_retries, AsyncIo, BoxedIo, Connector};
use crate::transport::effective_deadline;
use crate::{Transport, TransportConfig, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use telemux_proto::{FrameCodec, ProtocolError};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transport running one reader task and one writer task over a byte stream.
///
/// Built either from an accepted stream ([`StreamTransport::from_stream`]) or from
/// a [`Connector`] ([`StreamTransport::connect`]); only the latter can
/// [`reconnect`](StreamTransport::reconnect).
pub struct StreamTransport {
    shared: Arc<Shared>,
}

struct Shared {
    config: TransportConfig,
    connector: Option<Arc<dyn Connector>>,
    /// Accepted stream waiting for `start`
    pending_io: Mutex<Option<BoxedIo>>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    stop_requested: AtomicBool,
    send_errors: watch::Sender<Option<TransportError>>,
    recv_errors: watch::Sender<Option<TransportError>>,
}

/// One live connection
struct Link {
    generation: u64,
    outbound: mpsc::Sender<Bytes>,
    inbound: Arc<AsyncMutex<mpsc::Receiver<Inbound>>>,
    inbound_len: Arc<AtomicUsize>,
    cancel: CancellationToken,
    closed: bool,
}

/// A decoded frame, or a recoverable per-frame failure
type Inbound = Result<Bytes, TransportError>;

#[derive(Debug, Clone, Copy)]
enum Direction {
    Send,
    Recv,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StreamTransport {
    /// Wrap an already-established stream, e.g. an accepted agent connection
    pub fn from_stream<S: AsyncIo>(io: S, config: TransportConfig) -> Self {
        Self::build(Some(Box::new(io)), None, config)
    }

    /// Create a transport that dials through `connector` on start and reconnect
    pub fn connect<C: Connector + 'static>(connector: C, config: TransportConfig) -> Self {
        Self::build(None, Some(Arc::new(connector)), config)
    }

    fn build(io: Option<BoxedIo>, connector: Option<Arc<dyn Connector>>, config: TransportConfig) -> Self {
        let (send_errors, _) = watch::channel(None);
        let (recv_errors, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                pending_io: Mutex::new(io),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                stop_requested: AtomicBool::new(false),
                send_errors,
                recv_errors,
            }),
        }
    }

    /// Transport configuration
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Endpoint dialled on reconnect, if any
    pub fn endpoint(&self) -> Option<String> {
        self.shared.connector.as_ref().map(|c| c.endpoint())
    }

    /// Drop the current connection and dial again, backing off between
    /// attempts as configured. Stops retrying once [`Transport::stop`] is called.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let connector = self.shared.connector.clone().ok_or_else(|| {
            TransportError::Connection("transport wraps an accepted stream and cannot reconnect".to_string())
        })?;

        self.shared.close_current();
        self.shared.stop_requested.store(false, Ordering::Release);

        info!("Reconnecting to {}", connector.endpoint());
        let io = connect_with_retries(connector.as_ref(), &self.shared.config, &self.shared.stop_requested).await?;
        Shared::install(&self.shared, io);
        Ok(())
    }
}

impl Shared {
    fn install(shared: &Arc<Self>, io: BoxedIo) {
        let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (out_tx, out_rx) = mpsc::channel(shared.config.outbound_queue.max(1));
        let (in_tx, in_rx) = mpsc::channel(shared.config.inbound_queue.max(1));
        let cancel = CancellationToken::new();
        let inbound_len = Arc::new(AtomicUsize::new(0));
        let (reader, writer) = tokio::io::split(io);

        shared.send_errors.send_replace(None);
        shared.recv_errors.send_replace(None);

        let previous = lock(&shared.link).replace(Link {
            generation,
            outbound: out_tx,
            inbound: Arc::new(AsyncMutex::new(in_rx)),
            inbound_len: Arc::clone(&inbound_len),
            cancel: cancel.clone(),
            closed: false,
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        tokio::spawn(read_loop(Arc::clone(shared), generation, reader, in_tx, inbound_len, cancel.clone()));
        tokio::spawn(write_loop(Arc::clone(shared), generation, writer, out_rx, cancel));
        debug!(generation, "Transport link started");
    }

    /// Tear down link `generation` once. Returns false if it was already down
    /// or has been replaced.
    fn disconnect(&self, generation: u64, cause: Option<(Direction, TransportError)>) -> bool {
        {
            let mut link = lock(&self.link);
            match link.as_mut() {
                Some(current) if current.generation == generation && !current.closed => {
                    current.closed = true;
                    current.cancel.cancel();
                }
                _ => return false,
            }
        }

        match cause {
            Some((Direction::Recv, err)) => {
                if err.is_closed() {
                    debug!(generation, "Peer closed the stream");
                } else {
                    warn!(generation, "Transport read failed: {}", err);
                }
                self.recv_errors.send_replace(Some(err));
            }
            Some((Direction::Send, err)) => {
                warn!(generation, "Transport write failed: {}", err);
                self.send_errors.send_replace(Some(err));
            }
            None => debug!(generation, "Transport disconnected locally"),
        }
        true
    }

    fn close_current(&self) {
        let generation = lock(&self.link).as_ref().map(|l| l.generation);
        if let Some(generation) = generation {
            self.disconnect(generation, None);
        }
    }

    fn closed_error(&self, direction: Direction) -> TransportError {
        let recv = self.recv_errors.borrow().clone();
        let send = self.send_errors.borrow().clone();
        let latest = match direction {
            Direction::Recv => recv.or(send),
            Direction::Send => send.or(recv),
        };
        latest.unwrap_or(TransportError::StreamClosed)
    }

    fn outbound(&self) -> Result<mpsc::Sender<Bytes>, TransportError> {
        match lock(&self.link).as_ref() {
            Some(link) if !link.closed => Ok(link.outbound.clone()),
            Some(_) => Err(self.closed_error(Direction::Send)),
            None => Err(TransportError::NotRunning),
        }
    }

    fn check_size(&self, frame: &Bytes) -> Result<(), TransportError> {
        if frame.len() > self.config.max_frame_size {
            return Err(TransportError::Io {
                op: "send",
                message: format!("frame of {} bytes exceeds {}", frame.len(), self.config.max_frame_size),
            });
        }
        Ok(())
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut reader: ReadHalf<BoxedIo>,
    inbound: mpsc::Sender<Inbound>,
    inbound_len: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut codec = FrameCodec::with_max_frame_size(shared.config.max_frame_size);

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = codec.read_frame(&mut reader) => result,
        };

        let item = match result {
            Ok(Some(frame)) => Ok(frame),
            // The codec skips the rejected body, so the stream stays in sync
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                warn!(generation, size, max, "Skipping oversized inbound frame");
                Err(TransportError::FrameTooLarge { size, max })
            }
            Ok(None) => {
                shared.disconnect(generation, Some((Direction::Recv, TransportError::StreamClosed)));
                break;
            }
            Err(e) => {
                shared.disconnect(generation, Some((Direction::Recv, TransportError::from_protocol("read", e))));
                break;
            }
        };

        inbound_len.fetch_add(1, Ordering::AcqRel);
        let delivered = tokio::select! {
            _ = cancel.cancelled() => false,
            sent = inbound.send(item) => sent.is_ok(),
        };
        if !delivered {
            inbound_len.fetch_sub(1, Ordering::AcqRel);
            break;
        }
    }

    debug!(generation, "Transport reader stopped");
}

async fn write_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut writer: WriteHalf<BoxedIo>,
    mut outbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    let codec = FrameCodec::with_max_frame_size(shared.config.max_frame_size);
    let write_timeout = effective_deadline(shared.config.write_timeout);

    loop {
        // Queued frames are written before honouring cancellation so a local
        // stop does not lose the last acks.
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => frame,
            _ = cancel.cancelled() => break,
        };
        let Some(frame) = frame else { break };

        let write = codec.write_frame(&mut writer, &frame);
        let result = match write_timeout {
            Some(limit) => match timeout(limit, write).await {
                Ok(result) => result.map_err(|e| TransportError::from_protocol("write", e)),
                Err(_) => Err(TransportError::Timeout),
            },
            None => write.await.map_err(|e| TransportError::from_protocol("write", e)),
        };

        if let Err(e) = result {
            shared.disconnect(generation, Some((Direction::Send, e)));
            break;
        }
    }

    let shutdown_limit = write_timeout.unwrap_or(Duration::from_secs(1));
    let _ = timeout(shutdown_limit, writer.shutdown()).await;
    debug!(generation, "Transport writer stopped");
}

#[async_trait]
impl Transport for StreamTransport {
    async fn start(&self) -> Result<(), TransportError> {
        if self.is_running() {
            return Ok(());
        }
        self.shared.stop_requested.store(false, Ordering::Release);

        let pending = lock(&self.shared.pending_io).take();
        let io = match (pending, &self.shared.connector) {
            (Some(io), _) => io,
            (None, Some(connector)) => {
                connect_with_retries(connector.as_ref(), &self.shared.config, &self.shared.stop_requested).await?
            }
            (None, None) => {
                return Err(TransportError::Connection(
                    "accepted stream already consumed; nothing to start".to_string(),
                ))
            }
        };

        if self.is_running() {
            // Lost a race with a concurrent start
            return Ok(());
        }
        Shared::install(&self.shared, io);
        Ok(())
    }

    async fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.close_current();
        lock(&self.shared.link).take();
    }

    fn is_running(&self) -> bool {
        lock(&self.shared.link).as_ref().is_some_and(|link| !link.closed)
    }

    async fn send_frame(&self, frame: Bytes, deadline: Option<Duration>) -> Result<(), TransportError> {
        self.shared.check_size(&frame)?;
        let outbound = self.shared.outbound()?;

        match effective_deadline(deadline) {
            Some(limit) => outbound.send_timeout(frame, limit).await.map_err(|e| match e {
                SendTimeoutError::Timeout(_) => TransportError::Timeout,
                SendTimeoutError::Closed(_) => self.shared.closed_error(Direction::Send),
            }),
            None => outbound
                .send(frame)
                .await
                .map_err(|_| self.shared.closed_error(Direction::Send)),
        }
    }

    fn try_send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        self.shared.check_size(&frame)?;
        self.shared.outbound()?.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Closed(_) => self.shared.closed_error(Direction::Send),
        })
    }

    async fn recv_frame(&self, deadline: Option<Duration>) -> Result<Bytes, TransportError> {
        let (inbound, inbound_len) = match lock(&self.shared.link).as_ref() {
            Some(link) => (Arc::clone(&link.inbound), Arc::clone(&link.inbound_len)),
            None => return Err(TransportError::NotRunning),
        };

        let next = async {
            let mut rx = inbound.lock().await;
            rx.recv().await
        };
        let frame = match effective_deadline(deadline) {
            Some(limit) => timeout(limit, next).await.map_err(|_| TransportError::Timeout)?,
            None => next.await,
        };

        match frame {
            Some(item) => {
                inbound_len.fetch_sub(1, Ordering::AcqRel);
                item
            }
            None => Err(self.shared.closed_error(Direction::Recv)),
        }
    }

    fn outbound_len(&self) -> usize {
        lock(&self.shared.link)
            .as_ref()
            .map_or(0, |link| link.outbound.max_capacity() - link.outbound.capacity())
    }

    fn inbound_len(&self) -> usize {
        lock(&self.shared.link)
            .as_ref()
            .map_or(0, |link| link.inbound_len.load(Ordering::Acquire))
    }

    fn send_errors(&self) -> watch::Receiver<Option<TransportError>> {
        self.shared.send_errors.subscribe()
    }

    fn recv_errors(&self) -> watch::Receiver<Option<TransportError>> {
        self.shared.recv_errors.subscribe()
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        if let Some(link) = lock(&self.shared.link).take() {
            link.cancel.cancel();
        }
    }
}
