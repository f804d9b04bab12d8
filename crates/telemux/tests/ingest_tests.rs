//! Integration tests for report and log ingestion sessions

mod support;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::init_tracing;
use telemux::proto::{Ack, AgentId, DataEnvelope, FrameCodec, LogEntry, LogLevel, QueryClass, Report};
use telemux::transport::{StreamTransport, Transport, TransportConfig};
use telemux::{run_data_loop, run_log_loop, IngestConfig, LogIngestConfig, LogWriter, ReportWriter, WriteError};

#[derive(Default)]
struct Warehouse {
    reports: Mutex<Vec<(AgentId, Report)>>,
    logs: Mutex<Vec<(AgentId, LogEntry)>>,
}

#[async_trait]
impl ReportWriter for Warehouse {
    async fn write_report(&self, agent: &AgentId, report: &Report) -> Result<(), WriteError> {
        self.reports.lock().unwrap().push((agent.clone(), report.clone()));
        Ok(())
    }
}

#[async_trait]
impl LogWriter for Warehouse {
    async fn write_logs(&self, agent: &AgentId, entries: &[LogEntry]) -> Result<(), WriteError> {
        let mut logs = self.logs.lock().unwrap();
        logs.extend(entries.iter().map(|e| (agent.clone(), e.clone())));
        Ok(())
    }
}

fn report(minute: u64) -> Report {
    let mut metrics = BTreeMap::new();
    metrics.insert("query_time_sum".to_string(), 1.5 * minute as f64);
    metrics.insert("rows_examined_sum".to_string(), 1200.0);

    Report {
        service_instance: "db-primary".to_string(),
        start_ts: 1_700_000_000 + minute * 60,
        end_ts: 1_700_000_060 + minute * 60,
        run_time_ms: 40,
        classes: vec![QueryClass {
            id: "3A99CC42AEDCCFCD".to_string(),
            fingerprint: "select * from orders where id = ?".to_string(),
            metrics,
            example: Some("select * from orders where id = 7".to_string()),
        }],
    }
}

fn pipe() -> (StreamTransport, tokio::io::DuplexStream) {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    (StreamTransport::from_stream(local, TransportConfig::default()), remote)
}

/// A session of reports ends with a throttle ack once the budget is spent
#[tokio::test]
async fn test_report_session_until_throttled() -> Result<()> {
    init_tracing();
    let (transport, mut remote) = pipe();
    transport.start().await?;
    let warehouse = Arc::new(Warehouse::default());
    let config = IngestConfig { throttle_after: 5, ..IngestConfig::default() };

    let server = {
        let warehouse = Arc::clone(&warehouse);
        tokio::spawn(async move { run_data_loop(&AgentId::new("agent-1"), &transport, &*warehouse, &config).await })
    };

    let mut codec = FrameCodec::new();
    let mut acks = Vec::new();
    for minute in 0..6 {
        codec.write_frame(&mut remote, &DataEnvelope::v2(&report(minute))?.to_msgpack()?).await?;
        let frame = codec.read_frame(&mut remote).await?.expect("ack");
        acks.push(Ack::from_msgpack(&frame)?);
    }

    server.await??;
    assert!(acks[..5].iter().all(|ack| *ack == Ack::ok()));
    assert!(acks[5].is_throttle());

    let reports = warehouse.reports.lock().unwrap();
    assert_eq!(reports.len(), 6);
    assert_eq!(reports[3].1.start_ts, 1_700_000_180);
    assert_eq!(reports[0].1.classes[0].example.as_deref(), Some("select * from orders where id = 7"));
    Ok(())
}

/// Logs stream in, interleaved with noise, and all land in order
#[tokio::test]
async fn test_log_session() -> Result<()> {
    init_tracing();
    let (transport, mut remote) = pipe();
    transport.start().await?;
    let warehouse = Arc::new(Warehouse::default());
    let config = LogIngestConfig {
        batch_size: 4,
        flush_interval: Duration::from_millis(50),
        ..LogIngestConfig::default()
    };

    let server = {
        let warehouse = Arc::clone(&warehouse);
        tokio::spawn(async move { run_log_loop(&AgentId::new("agent-1"), &transport, &*warehouse, &config).await })
    };

    let codec = FrameCodec::new();
    for i in 0..10 {
        let entry = LogEntry::new(LogLevel::Info, "qan-agent", format!("line {i}"));
        codec.write_frame(&mut remote, &entry.to_msgpack()?).await?;
        if i == 4 {
            codec.write_frame(&mut remote, b"\x00\x01garbage").await?;
        }
    }
    drop(remote);

    tokio::time::timeout(Duration::from_secs(5), server).await???;

    let logs = warehouse.logs.lock().unwrap();
    let lines: Vec<_> = logs.iter().map(|(_, e)| e.msg.as_str()).collect();
    let expected: Vec<_> = (0..10).map(|i| format!("line {i}")).collect();
    assert_eq!(lines, expected);
    assert!(logs.iter().all(|(agent, _)| agent.as_str() == "agent-1"));
    Ok(())
}
