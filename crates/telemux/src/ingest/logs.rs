//! Agent log ingestion

use super::LogIngestConfig;
use crate::store::LogWriter;
use crate::{IngestError, WriteErrorKind};
use telemux_proto::{AgentId, LogEntry};
use telemux_transport::{Transport, TransportError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Ingest log entries from `transport` into `writer` in batches.
///
/// A batch is written when it reaches `config.batch_size` entries or when the
/// flush interval elapses with entries buffered. No acks are sent. End of
/// stream flushes what is buffered and returns `Ok`.
pub async fn run_log_loop(
    agent: &AgentId,
    transport: &dyn Transport,
    writer: &dyn LogWriter,
    config: &LogIngestConfig,
) -> Result<(), IngestError> {
    let batch_size = config.batch_size.max(1);
    let mut buffer = Vec::with_capacity(batch_size);
    let mut ticker = interval_at(Instant::now() + config.flush_interval, config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = transport.recv_frame(None) => {
                let frame = match received {
                    Ok(frame) => frame,
                    Err(TransportError::StreamClosed) => {
                        debug!(agent = %agent, buffered = buffer.len(), "Log stream closed");
                        return flush(agent, writer, &mut buffer, config).await;
                    }
                    Err(TransportError::FrameTooLarge { size, max }) => {
                        warn!(agent = %agent, size, max, "Skipping oversized log frame");
                        continue;
                    }
                    Err(e) => {
                        if let Err(flush_error) = flush(agent, writer, &mut buffer, config).await {
                            warn!(agent = %agent, "Final log flush failed: {}", flush_error);
                        }
                        return Err(e.into());
                    }
                };

                match LogEntry::from_msgpack(&frame) {
                    Ok(entry) => {
                        buffer.push(entry);
                        if buffer.len() >= batch_size {
                            flush(agent, writer, &mut buffer, config).await?;
                        }
                    }
                    Err(e) => warn!(agent = %agent, "Skipping undecodable log entry: {}", e),
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(agent, writer, &mut buffer, config).await?;
                }
            }
        }
    }
}

/// Write and clear the buffer. Only network failures are fatal.
async fn flush(
    agent: &AgentId,
    writer: &dyn LogWriter,
    buffer: &mut Vec<LogEntry>,
    config: &LogIngestConfig,
) -> Result<(), IngestError> {
    if buffer.is_empty() {
        return Ok(());
    }

    let result = writer.write_logs(agent, &buffer[..]).await;
    let count = buffer.len();
    buffer.clear();

    match result {
        Ok(()) => {
            debug!(agent = %agent, count, "Log batch written");
            Ok(())
        }
        Err(e) => match e.kind {
            WriteErrorKind::Network => {
                error!(agent = %agent, count, "Log write failed, ending session: {}", e);
                Err(e.into())
            }
            WriteErrorKind::ReadOnly => {
                warn!(agent = %agent, count, backoff = ?config.read_only_backoff, "Log store is read-only, batch dropped");
                tokio::time::sleep(config.read_only_backoff).await;
                Ok(())
            }
            WriteErrorKind::Other => {
                warn!(agent = %agent, count, "Log batch not written: {}", e);
                Ok(())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WriteError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use telemux_proto::{FrameCodec, LogLevel};
    use telemux_transport::{StreamTransport, TransportConfig};
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    /// Forwards each batch to the test; pops scripted failures first
    struct ChannelWriter {
        batches: mpsc::UnboundedSender<Vec<LogEntry>>,
        failures: Mutex<Vec<WriteError>>,
    }

    #[async_trait]
    impl LogWriter for ChannelWriter {
        async fn write_logs(&self, _agent: &AgentId, entries: &[LogEntry]) -> Result<(), WriteError> {
            if let Some(failure) = self.failures.lock().unwrap().pop() {
                return Err(failure);
            }
            let _ = self.batches.send(entries.to_vec());
            Ok(())
        }
    }

    fn writer(failures: Vec<WriteError>) -> (ChannelWriter, mpsc::UnboundedReceiver<Vec<LogEntry>>) {
        let (batches, rx) = mpsc::unbounded_channel();
        (ChannelWriter { batches, failures: Mutex::new(failures) }, rx)
    }

    async fn session() -> (StreamTransport, DuplexStream) {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let transport = StreamTransport::from_stream(local, TransportConfig::default());
        transport.start().await.unwrap();
        (transport, peer)
    }

    async fn log(peer: &mut DuplexStream, msg: &str) {
        let entry = LogEntry::new(LogLevel::Info, "qan-agent", msg);
        FrameCodec::new().write_frame(peer, &entry.to_msgpack().unwrap()).await.unwrap();
    }

    fn messages(batch: &[LogEntry]) -> Vec<&str> {
        batch.iter().map(|e| e.msg.as_str()).collect()
    }

    fn agent_id() -> AgentId {
        AgentId::new("agent-1")
    }

    #[tokio::test]
    async fn test_full_batches_and_final_flush() {
        let (transport, mut peer) = session().await;
        let (writer, mut batches) = writer(Vec::new());
        let config = LogIngestConfig { batch_size: 2, flush_interval: Duration::from_secs(3600), ..Default::default() };

        for msg in ["a", "b", "c"] {
            log(&mut peer, msg).await;
        }
        FrameCodec::new().write_frame(&mut peer, b"\xc1").await.unwrap();
        drop(peer);

        run_log_loop(&agent_id(), &transport, &writer, &config).await.unwrap();

        assert_eq!(messages(&batches.recv().await.unwrap()), vec!["a", "b"]);
        assert_eq!(messages(&batches.recv().await.unwrap()), vec!["c"]);
        assert!(batches.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_flushes_partial_batch() {
        let (transport, mut peer) = session().await;
        let (writer, mut batches) = writer(Vec::new());
        let config = LogIngestConfig { batch_size: 100, ..Default::default() };

        let session = tokio::spawn(async move {
            run_log_loop(&agent_id(), &transport, &writer, &config).await
        });

        log(&mut peer, "slow").await;
        let batch = tokio::time::timeout(Duration::from_secs(5), batches.recv()).await.unwrap().unwrap();
        assert_eq!(messages(&batch), vec!["slow"]);

        drop(peer);
        session.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_only_backs_off_and_continues() {
        let (transport, mut peer) = session().await;
        let (writer, mut batches) = writer(vec![WriteError::read_only("replica")]);
        let config = LogIngestConfig { batch_size: 1, ..Default::default() };

        log(&mut peer, "dropped").await;
        log(&mut peer, "kept").await;
        drop(peer);

        let started = Instant::now();
        run_log_loop(&agent_id(), &transport, &writer, &config).await.unwrap();
        assert!(started.elapsed() >= config.read_only_backoff);

        assert_eq!(messages(&batches.recv().await.unwrap()), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_oversized_log_frame_skipped() {
        let (local, mut peer) = tokio::io::duplex(64 * 1024);
        let transport = StreamTransport::from_stream(local, TransportConfig::default().with_max_frame_size(512));
        transport.start().await.unwrap();
        let (writer, mut batches) = writer(Vec::new());
        let config = LogIngestConfig { batch_size: 1, ..Default::default() };

        log(&mut peer, &"x".repeat(4096)).await;
        log(&mut peer, "fits").await;
        drop(peer);

        run_log_loop(&agent_id(), &transport, &writer, &config).await.unwrap();
        assert_eq!(messages(&batches.recv().await.unwrap()), vec!["fits"]);
        assert!(batches.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_network_failure_is_fatal() {
        let (transport, mut peer) = session().await;
        let (writer, _batches) = writer(vec![WriteError::network("connection reset")]);
        let config = LogIngestConfig { batch_size: 1, ..Default::default() };

        log(&mut peer, "lost").await;

        let result = run_log_loop(&agent_id(), &transport, &writer, &config).await;
        assert!(matches!(
            result,
            Err(IngestError::Write(WriteError { kind: WriteErrorKind::Network, .. }))
        ));
    }

    #[tokio::test]
    async fn test_other_failure_continues() {
        let (transport, mut peer) = session().await;
        let (writer, mut batches) = writer(vec![WriteError::other("conflict")]);
        let config = LogIngestConfig { batch_size: 1, ..Default::default() };

        log(&mut peer, "first").await;
        log(&mut peer, "second").await;
        drop(peer);

        run_log_loop(&agent_id(), &transport, &writer, &config).await.unwrap();
        assert_eq!(messages(&batches.recv().await.unwrap()), vec!["second"]);
    }
}
