//! Streaming ingestion payloads: data envelopes, query reports, log entries and acks

use crate::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Acknowledgement returned for each ingested data frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Status code
    pub code: u16,
    /// Error detail; empty on success
    pub error: String,
}

impl Ack {
    /// Frame accepted
    pub const OK: u16 = 200;
    /// Frame accepted, stop sending for this session
    pub const THROTTLE: u16 = 429;
    /// Frame could not be decoded
    pub const MALFORMED: u16 = 400;
    /// Reserved: server-side transport fault
    pub const INTERNAL: u16 = 500;
    /// Reserved: server unavailable
    pub const UNAVAILABLE: u16 = 503;

    /// Accepted
    pub fn ok() -> Self {
        Self { code: Self::OK, error: String::new() }
    }

    /// Accepted, but the agent must end the session
    pub fn throttle() -> Self {
        Self {
            code: Self::THROTTLE,
            error: "too many messages for this session".to_string(),
        }
    }

    /// Rejected as malformed
    pub fn malformed(error: impl Into<String>) -> Self {
        Self { code: Self::MALFORMED, error: error.into() }
    }

    /// Whether this ack tells the agent to stop
    pub fn is_throttle(&self) -> bool {
        self.code == Self::THROTTLE
    }

    /// Encode to MessagePack
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode from MessagePack
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Versioned wrapper around a serialized report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEnvelope {
    /// Report format version
    pub version: u8,
    /// Serialized report
    pub payload: Bytes,
}

impl DataEnvelope {
    /// Wrap a report of the current version
    pub fn v2(report: &ReportV2) -> Result<Self, ProtocolError> {
        Ok(Self {
            version: 2,
            payload: rmp_serde::to_vec_named(report)?.into(),
        })
    }

    /// Wrap a legacy report
    pub fn v1(report: &ReportV1) -> Result<Self, ProtocolError> {
        Ok(Self {
            version: 1,
            payload: rmp_serde::to_vec_named(report)?.into(),
        })
    }

    /// Encode to MessagePack
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode from MessagePack
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Decode the inner report according to the declared version
    pub fn report(&self) -> Result<Report, ProtocolError> {
        match self.version {
            1 => Ok(rmp_serde::from_slice::<ReportV1>(&self.payload)?.into()),
            2 => Ok(rmp_serde::from_slice::<ReportV2>(&self.payload)?.into()),
            other => Err(ProtocolError::UnsupportedVersion(other)),
        }
    }
}

/// Aggregated metrics for one query class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryClass {
    /// Class identifier (fingerprint checksum)
    pub id: String,
    /// Normalized query text
    pub fingerprint: String,
    /// Named metric values
    pub metrics: BTreeMap<String, f64>,
    /// One concrete example query, when the agent captured it
    pub example: Option<String>,
}

/// Canonical report handed to the persistent writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Monitored instance the report covers
    pub service_instance: String,
    /// Interval start, Unix seconds
    pub start_ts: u64,
    /// Interval end, Unix seconds
    pub end_ts: u64,
    /// Time the agent spent collecting, milliseconds
    pub run_time_ms: u64,
    /// Per-class metrics
    pub classes: Vec<QueryClass>,
}

/// Legacy report format: no run time and no per-class examples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportV1 {
    /// Monitored instance
    pub instance: String,
    /// Interval start, Unix seconds
    pub start_ts: u64,
    /// Interval end, Unix seconds
    pub end_ts: u64,
    /// Per-class metrics
    pub classes: Vec<ClassV1>,
}

/// Query class in the legacy format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassV1 {
    /// Class identifier
    pub id: String,
    /// Normalized query text
    pub fingerprint: String,
    /// Named metric values
    pub metrics: BTreeMap<String, f64>,
}

/// Current report format
pub type ReportV2 = Report;

impl From<ReportV1> for Report {
    fn from(v1: ReportV1) -> Self {
        Self {
            service_instance: v1.instance,
            start_ts: v1.start_ts,
            end_ts: v1.end_ts,
            run_time_ms: 0,
            classes: v1
                .classes
                .into_iter()
                .map(|c| QueryClass {
                    id: c.id,
                    fingerprint: c.fingerprint,
                    metrics: c.metrics,
                    example: None,
                })
                .collect(),
        }
    }
}

/// Log severity reported by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    /// Debug
    Debug,
    /// Informational
    Info,
    /// Warning
    Warning,
    /// Error
    Error,
    /// Fatal
    Fatal,
}

/// One log line streamed by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Event time in Unix milliseconds
    pub ts: u64,
    /// Severity
    pub level: LogLevel,
    /// Emitting service on the agent
    pub service: String,
    /// Message text
    pub msg: String,
    /// Whether the entry was spooled while the agent was offline
    #[serde(default)]
    pub offline: bool,
}

impl LogEntry {
    /// Create an entry stamped with the current time
    pub fn new(level: LogLevel, service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            ts: crate::message::unix_millis(),
            level,
            service: service.into(),
            msg: msg.into(),
            offline: false,
        }
    }

    /// Encode to MessagePack
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode from MessagePack
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_v1() -> ReportV1 {
        ReportV1 {
            instance: "db-01".to_string(),
            start_ts: 100,
            end_ts: 160,
            classes: vec![ClassV1 {
                id: "abc".to_string(),
                fingerprint: "select ?".to_string(),
                metrics: BTreeMap::from([("query_count".to_string(), 3.0)]),
            }],
        }
    }

    #[test]
    fn test_v1_upgrades_to_canonical() {
        let envelope = DataEnvelope::v1(&sample_v1()).unwrap();
        let report = envelope.report().unwrap();

        assert_eq!(report.service_instance, "db-01");
        assert_eq!(report.run_time_ms, 0);
        assert_eq!(report.classes.len(), 1);
        assert_eq!(report.classes[0].example, None);
        assert_eq!(report.classes[0].metrics["query_count"], 3.0);
    }

    #[test]
    fn test_v2_decodes_in_place() {
        let report: Report = sample_v1().into();
        let envelope = DataEnvelope::v2(&report).unwrap();
        let wire = envelope.to_msgpack().unwrap();

        let decoded = DataEnvelope::from_msgpack(&wire).unwrap().report().unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn test_unsupported_version() {
        let envelope = DataEnvelope { version: 9, payload: Bytes::from_static(b"x") };
        assert!(matches!(envelope.report(), Err(ProtocolError::UnsupportedVersion(9))));
    }

    #[test]
    fn test_version_mismatch_is_decode_error() {
        // A v1 body labelled as v2 must not be silently accepted
        let mut envelope = DataEnvelope::v1(&sample_v1()).unwrap();
        envelope.version = 2;
        assert!(matches!(envelope.report(), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_ack_codes() {
        assert_eq!(Ack::ok().code, 200);
        assert!(Ack::throttle().is_throttle());
        let malformed = Ack::malformed("bad envelope");
        assert_eq!(malformed.code, Ack::MALFORMED);

        let decoded = Ack::from_msgpack(&malformed.to_msgpack().unwrap()).unwrap();
        assert_eq!(decoded, malformed);
    }
}
