//! Request/reply multiplexing over one transport
//!
//! Many local callers share one agent connection. Each `send` gets a
//! single-slot response sink; one outbound pump serializes requests onto the
//! transport in submission order, one inbound pump feeds raw frames to the
//! dispatch workers, and the workers route decoded replies back to the
//! waiting sink.

use crate::processor::{Processor, Received};
use crate::MuxError;
use bytes::Bytes;
use metrics::counter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use telemux_proto::CorrelationId;
use telemux_transport::{Transport, TransportError};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Frames dropped because the transport's outbound queue was full
pub const FRAMES_DROPPED_TOTAL: &str = "telemux_frames_dropped_total";

/// Multiplexer configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Session label used in logs
    pub name: String,
    /// Reply-dispatch workers; values below 1 mean 1
    pub concurrency: usize,
    /// How long `send` waits for room in the request queue
    pub send_timeout: Duration,
    /// How long `send` waits for the reply
    pub recv_timeout: Duration,
    /// Capacity of the request queue feeding the outbound pump
    pub request_queue: usize,
    /// Capacity of the inbound frame buffer and the remote-reply queue
    pub reply_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            concurrency: 1,
            send_timeout: Duration::from_secs(2),
            recv_timeout: Duration::from_secs(20),
            request_queue: 100,
            reply_buffer: 100,
        }
    }
}

impl MuxConfig {
    /// Set the session label
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of dispatch workers
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the submit and reply windows
    pub fn with_timeouts(mut self, send_timeout: Duration, recv_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self.recv_timeout = recv_timeout;
        self
    }

    /// Set the request queue capacity
    pub fn with_request_queue(mut self, size: usize) -> Self {
        self.request_queue = size;
        self
    }

    fn workers(&self) -> usize {
        self.concurrency.max(1)
    }
}

type Sink<T> = oneshot::Sender<Result<T, MuxError>>;

/// A request travelling from `send` to the outbound pump
struct Submission<P: Processor> {
    request: P::Request,
    sink: Sink<P::Response>,
    /// Filled by the pump, under the pending lock, once the ID is registered
    id_slot: Arc<OnceLock<CorrelationId>>,
}

enum Lifecycle<P: Processor> {
    Idle,
    Running { requests: mpsc::Sender<Submission<P>> },
    Stopped,
}

/// Multiplexes synchronous `send` calls over one [`Transport`].
///
/// Cloning yields another handle to the same session.
pub struct Multiplexer<P: Processor> {
    inner: Arc<Inner<P>>,
}

impl<P: Processor> Clone for Multiplexer<P> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct Inner<P: Processor> {
    processor: Arc<P>,
    transport: Arc<dyn Transport>,
    config: MuxConfig,
    pending: Mutex<HashMap<CorrelationId, Sink<P::Response>>>,
    lifecycle: Mutex<Lifecycle<P>>,
    /// Tells every worker to exit
    shutdown: CancellationToken,
    /// Cancelled exactly once, after teardown
    done: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<P: Processor> Multiplexer<P> {
    /// Create a stopped multiplexer.
    ///
    /// Fails if the processor needs serial dispatch and more than one worker
    /// is configured.
    pub fn new(processor: P, transport: Arc<dyn Transport>, config: MuxConfig) -> Result<Self, MuxError> {
        if processor.serial_dispatch() && config.workers() != 1 {
            return Err(MuxError::Config(format!(
                "{}: processor requires serial dispatch but concurrency is {}",
                config.name, config.concurrency
            )));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                processor: Arc::new(processor),
                transport,
                config,
                pending: Mutex::new(HashMap::new()),
                lifecycle: Mutex::new(Lifecycle::Idle),
                shutdown: CancellationToken::new(),
                done: CancellationToken::new(),
            }),
        })
    }

    /// Session processor
    pub fn processor(&self) -> &P {
        &self.inner.processor
    }

    /// Underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Configuration
    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    /// Start the transport and the workers. Idempotent while running; a
    /// stopped multiplexer cannot be restarted.
    pub async fn start(&self) -> Result<(), MuxError> {
        match &*lock(&self.inner.lifecycle) {
            Lifecycle::Running { .. } => return Ok(()),
            Lifecycle::Stopped => return Err(MuxError::Stopped),
            Lifecycle::Idle => {}
        }

        self.inner.transport.start().await?;

        let config = &self.inner.config;
        let (requests_tx, requests_rx) = mpsc::channel(config.request_queue.max(1));
        let (frames_tx, frames_rx) = mpsc::channel(config.reply_buffer.max(1));
        let (remote_tx, remote_rx) = mpsc::channel(config.reply_buffer.max(1));

        let stopped = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            match *lifecycle {
                Lifecycle::Running { .. } => return Ok(()),
                Lifecycle::Stopped => true,
                Lifecycle::Idle => {
                    *lifecycle = Lifecycle::Running { requests: requests_tx };
                    false
                }
            }
        };
        if stopped {
            // `stop` ran while the transport was starting and found nothing
            // to tear down yet
            self.inner.transport.stop().await;
            return Err(MuxError::Stopped);
        }

        tokio::spawn(outbound_pump(Arc::clone(&self.inner), requests_rx, remote_rx));
        tokio::spawn(inbound_pump(Arc::clone(&self.inner), frames_tx));

        let frames = Arc::new(AsyncMutex::new(frames_rx));
        for worker in 0..config.workers() {
            tokio::spawn(dispatch_worker(
                Arc::clone(&self.inner),
                worker,
                Arc::clone(&frames),
                remote_tx.clone(),
            ));
        }

        info!(session = %config.name, workers = config.workers(), "Multiplexer started");
        Ok(())
    }

    /// Stop the transport and every worker, failing all pending calls with
    /// [`MuxError::Stopped`]. Idempotent.
    pub async fn stop(&self) {
        self.inner.shutdown(None).await;
    }

    /// Wait until the multiplexer has stopped
    pub async fn done(&self) {
        self.inner.done.cancelled().await;
    }

    /// Whether [`done`](Self::done) has been signalled
    pub fn is_done(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Whether the session is running
    pub fn is_running(&self) -> bool {
        matches!(&*lock(&self.inner.lifecycle), Lifecycle::Running { .. })
    }

    /// Calls waiting for a reply
    pub fn pending_len(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Send `request` and wait for its reply.
    ///
    /// Returns immediately with `NotRunning`/`Stopped` outside the running
    /// state. Otherwise waits up to `send_timeout` for queue space and then up
    /// to `recv_timeout` for the reply.
    pub async fn send(&self, request: P::Request) -> Result<P::Response, MuxError> {
        let requests = match &*lock(&self.inner.lifecycle) {
            Lifecycle::Idle => return Err(MuxError::NotRunning),
            Lifecycle::Stopped => return Err(MuxError::Stopped),
            Lifecycle::Running { requests } => requests.clone(),
        };

        let config = &self.inner.config;
        let (sink, reply) = oneshot::channel();
        let id_slot = Arc::new(OnceLock::new());
        let submission = Submission {
            request,
            sink,
            id_slot: Arc::clone(&id_slot),
        };

        match requests.send_timeout(submission, config.send_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                return Err(MuxError::SendTimeout { duration: config.send_timeout });
            }
            Err(SendTimeoutError::Closed(_)) => return Err(MuxError::Stopped),
        }
        drop(requests);

        match timeout(config.recv_timeout, reply).await {
            Ok(Ok(result)) => result,
            // Sink dropped unanswered: the pump shut down with the request queued
            Ok(Err(_)) => Err(MuxError::Stopped),
            Err(_) => {
                self.inner.abandon(&id_slot).await;
                Err(MuxError::RecvTimeout { duration: config.recv_timeout })
            }
        }
    }
}

impl<P: Processor> Inner<P> {
    /// Tear down once; later calls are no-ops.
    async fn shutdown(&self, cause: Option<TransportError>) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if matches!(*lifecycle, Lifecycle::Stopped) {
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }

        let name = &self.config.name;
        match &cause {
            None => info!(session = %name, "Stopping multiplexer"),
            Some(e) if e.is_closed() => debug!(session = %name, "Stream closed, stopping multiplexer"),
            Some(e) => warn!(session = %name, "Transport failed, stopping multiplexer: {}", e),
        }

        self.shutdown.cancel();
        self.transport.stop().await;

        let pending: Vec<_> = lock(&self.pending).drain().collect();
        if !pending.is_empty() {
            debug!(session = %name, count = pending.len(), "Failing pending calls");
        }
        for (id, sink) in pending {
            self.processor.timeout(id).await;
            let _ = sink.send(Err(MuxError::Stopped));
        }

        self.done.cancel();
    }

    /// Clean up after a caller whose reply window expired
    async fn abandon(&self, id_slot: &OnceLock<CorrelationId>) {
        let expired = {
            let mut pending = lock(&self.pending);
            id_slot.get().copied().filter(|id| pending.remove(id).is_some())
        };
        if let Some(id) = expired {
            debug!(session = %self.config.name, %id, "Call timed out");
            self.processor.timeout(id).await;
        }
        // If the pump has not registered the ID yet it sees the closed sink
        // and releases the bookkeeping itself.
    }

    /// Outbound pump: encode, register, enqueue
    async fn submit(&self, submission: Submission<P>) {
        let Submission { request, sink, id_slot } = submission;
        let name = &self.config.name;

        if sink.is_closed() {
            debug!(session = %name, "Caller gave up before the request was sent");
            return;
        }

        let (id, bytes) = match self.processor.before_send(request).await {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(session = %name, "Dropping request: {}", e);
                let _ = sink.send(Err(MuxError::Rejected(e.to_string())));
                return;
            }
        };

        enum Outcome<T> {
            Registered,
            Abandoned,
            Stopping(Sink<T>),
            Duplicate(Sink<T>),
        }

        let outcome = {
            let mut pending = lock(&self.pending);
            if self.shutdown.is_cancelled() {
                Outcome::Stopping(sink)
            } else if sink.is_closed() {
                Outcome::Abandoned
            } else if pending.contains_key(&id) {
                Outcome::Duplicate(sink)
            } else {
                pending.insert(id, sink);
                let _ = id_slot.set(id);
                Outcome::Registered
            }
        };

        match outcome {
            Outcome::Registered => {}
            Outcome::Abandoned => {
                debug!(session = %name, %id, "Caller gave up while the request was encoded");
                self.processor.timeout(id).await;
                return;
            }
            Outcome::Stopping(sink) => {
                self.processor.timeout(id).await;
                let _ = sink.send(Err(MuxError::Stopped));
                return;
            }
            Outcome::Duplicate(sink) => {
                error!(session = %name, %id, "Duplicate correlation ID in flight; request dropped");
                let _ = sink.send(Err(MuxError::Rejected(format!("duplicate correlation ID {}", id))));
                return;
            }
        }

        match self.transport.try_send_frame(bytes) {
            Ok(()) => trace!(session = %name, %id, "Request queued"),
            Err(TransportError::QueueFull) => {
                counter!(FRAMES_DROPPED_TOTAL).increment(1);
                debug!(session = %name, %id, "Outbound queue full, frame dropped");
            }
            Err(e) => debug!(session = %name, %id, "Transport refused frame: {}", e),
        }
    }

    /// Outbound pump: write back a reply nobody here was waiting for
    fn relay(&self, id: CorrelationId, value: P::Response) {
        let name = &self.config.name;
        match self.processor.encode_remote(id, &value) {
            Ok(Some(bytes)) => {
                if let Err(e) = self.transport.try_send_frame(bytes) {
                    debug!(session = %name, %id, "Remote reply not written: {}", e);
                }
            }
            Ok(None) => debug!(session = %name, %id, "No caller waiting for reply; dropped"),
            Err(e) => warn!(session = %name, %id, "Failed to encode remote reply: {}", e),
        }
    }

    /// Dispatch worker: decode one frame and route it
    async fn dispatch(&self, frame: Bytes, remote: &mpsc::Sender<(CorrelationId, P::Response)>) {
        let name = &self.config.name;
        match self.processor.after_recv(frame).await {
            Received::Reply { id, value, error } => {
                if let Some(e) = error {
                    warn!(session = %name, %id, "Reply side effect failed: {}", e);
                }

                let sink = lock(&self.pending).remove(&id);
                match sink {
                    Some(sink) => {
                        if sink.send(Ok(value)).is_err() {
                            debug!(session = %name, %id, "Caller no longer waiting; reply dropped");
                        }
                    }
                    None => {
                        if remote.try_send((id, value)).is_err() {
                            warn!(session = %name, %id, "Remote reply queue full; reply dropped");
                        }
                    }
                }
            }
            Received::Ignore => trace!(session = %name, "Frame ignored"),
            Received::Unroutable(e) => warn!(session = %name, "Dropping unroutable frame: {}", e),
        }
    }
}

async fn outbound_pump<P: Processor>(
    inner: Arc<Inner<P>>,
    mut requests: mpsc::Receiver<Submission<P>>,
    mut remote: mpsc::Receiver<(CorrelationId, P::Response)>,
) {
    let mut send_errors = inner.transport.send_errors();

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            Some(submission) = requests.recv() => inner.submit(submission).await,
            Some((id, value)) = remote.recv() => inner.relay(id, value),
            Ok(()) = send_errors.changed() => {
                let failure = send_errors.borrow_and_update().clone();
                if let Some(e) = failure {
                    inner.shutdown(Some(e)).await;
                    break;
                }
            }
        }
    }

    debug!(session = %inner.config.name, "Outbound pump stopped");
}

async fn inbound_pump<P: Processor>(inner: Arc<Inner<P>>, frames: mpsc::Sender<Bytes>) {
    loop {
        let received = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            received = inner.transport.recv_frame(None) => received,
        };

        match received {
            Ok(frame) => {
                let forwarded = tokio::select! {
                    _ = inner.shutdown.cancelled() => false,
                    sent = frames.send(frame) => sent.is_ok(),
                };
                if !forwarded {
                    break;
                }
            }
            Err(TransportError::FrameTooLarge { size, max }) => {
                warn!(session = %inner.config.name, size, max, "Skipping oversized frame");
            }
            Err(e) => {
                inner.shutdown(Some(e)).await;
                break;
            }
        }
    }

    debug!(session = %inner.config.name, "Inbound pump stopped");
}

async fn dispatch_worker<P: Processor>(
    inner: Arc<Inner<P>>,
    worker: usize,
    frames: Arc<AsyncMutex<mpsc::Receiver<Bytes>>>,
    remote: mpsc::Sender<(CorrelationId, P::Response)>,
) {
    loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            frame = async { frames.lock().await.recv().await } => frame,
        };
        let Some(frame) = frame else { break };
        inner.dispatch(frame, &remote).await;
    }

    debug!(session = %inner.config.name, worker, "Dispatch worker stopped");
}
