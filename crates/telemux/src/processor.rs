//! Per-session encode/correlate/side-effect strategy

use crate::ProcessError;
use async_trait::async_trait;
use bytes::Bytes;
use telemux_proto::CorrelationId;

/// Outcome of decoding one inbound frame
#[derive(Debug)]
pub enum Received<T> {
    /// Reply correlated to `id`. `error` reports a side effect that failed;
    /// the reply is still routed.
    Reply {
        /// Correlation ID recovered from the frame
        id: CorrelationId,
        /// Decoded reply
        value: T,
        /// Non-fatal side-effect failure
        error: Option<ProcessError>,
    },
    /// Sanctioned no-op, e.g. a keep-alive
    Ignore,
    /// Frame could not be routed
    Unroutable(ProcessError),
}

/// Session strategy plugged into a [`Multiplexer`](crate::Multiplexer).
///
/// The multiplexer calls `before_send` from its single outbound pump and
/// `after_recv` from its dispatch workers; implementations only see bytes and
/// their own message types.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Message accepted by `send`
    type Request: Send + 'static;
    /// Value returned to the caller
    type Response: Send + 'static;

    /// Assign a correlation ID unless the request already carries one,
    /// serialize it and record any bookkeeping.
    async fn before_send(&self, request: Self::Request) -> Result<(CorrelationId, Bytes), ProcessError>;

    /// Decode an inbound frame, recover its ID and run side effects.
    async fn after_recv(&self, frame: Bytes) -> Received<Self::Response>;

    /// Release bookkeeping for a call that will never be answered.
    async fn timeout(&self, id: CorrelationId);

    /// Whether replies must be processed strictly in arrival order. A
    /// multiplexer refuses to run such a processor with more than one
    /// dispatch worker.
    fn serial_dispatch(&self) -> bool {
        false
    }

    /// Encode a correlated value that no local caller was waiting for, so it
    /// can be written back to the remote side. `Ok(None)` drops it.
    fn encode_remote(&self, _id: CorrelationId, _value: &Self::Response) -> Result<Option<Bytes>, ProcessError> {
        Ok(None)
    }
}
