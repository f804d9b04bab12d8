//! Query-report ingestion

use super::IngestConfig;
use crate::store::ReportWriter;
use crate::{IngestError, WriteErrorKind};
use telemux_proto::{Ack, AgentId, DataEnvelope};
use telemux_transport::{Transport, TransportError, TransportExt};
use tracing::{debug, error, info, warn};

/// Ingest versioned report envelopes from `transport` into `writer`.
///
/// Every written frame is acknowledged. Once more than
/// `config.throttle_after` frames have been accepted the ack carries the
/// throttle code and the loop returns `Ok`. End of stream also returns `Ok`.
pub async fn run_data_loop(
    agent: &AgentId,
    transport: &dyn Transport,
    writer: &dyn ReportWriter,
    config: &IngestConfig,
) -> Result<(), IngestError> {
    let ack_deadline = Some(config.recv_timeout);
    let mut accepted: u64 = 0;

    loop {
        let frame = match transport.recv_frame(Some(config.recv_timeout)).await {
            Ok(frame) => frame,
            Err(TransportError::StreamClosed) => {
                debug!(agent = %agent, accepted, "Data stream closed");
                return Ok(());
            }
            Err(TransportError::FrameTooLarge { size, max }) => {
                warn!(agent = %agent, size, max, "Dropping oversized report frame");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let envelope = match DataEnvelope::from_msgpack(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(agent = %agent, "Malformed data envelope: {}", e);
                transport.send_message(&Ack::malformed(e.to_string()), ack_deadline).await?;
                continue;
            }
        };

        if envelope.payload.len() > config.max_payload {
            warn!(
                agent = %agent,
                size = envelope.payload.len(),
                max = config.max_payload,
                "Dropping oversized report"
            );
            continue;
        }

        let report = match envelope.report() {
            Ok(report) => report,
            Err(e) => {
                warn!(agent = %agent, version = envelope.version, "Malformed report: {}", e);
                transport.send_message(&Ack::malformed(e.to_string()), ack_deadline).await?;
                continue;
            }
        };

        if let Err(e) = writer.write_report(agent, &report).await {
            match e.kind {
                WriteErrorKind::Network | WriteErrorKind::ReadOnly => {
                    error!(agent = %agent, "Report write failed, ending session: {}", e);
                    return Err(e.into());
                }
                WriteErrorKind::Other => {
                    warn!(agent = %agent, instance = %report.service_instance, "Report not written: {}", e);
                    continue;
                }
            }
        }

        accepted += 1;
        if accepted > config.throttle_after {
            info!(agent = %agent, accepted, "Throttling data session");
            transport.send_message(&Ack::throttle(), ack_deadline).await?;
            return Ok(());
        }

        debug!(agent = %agent, instance = %report.service_instance, classes = report.classes.len(), "Report written");
        transport.send_message(&Ack::ok(), ack_deadline).await?;
    }
}
