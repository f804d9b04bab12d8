//! Persistence seams used by the agent processor and the ingestion loops
//!
//! The server supplies the real backends; this crate only defines the
//! contracts. Writers classify their own failures so the loops can decide
//! whether to abort.

use crate::{StoreError, WriteError};
use async_trait::async_trait;
use telemux_proto::{AgentId, LogEntry, Report, ServiceConfig, VersionInfo};

/// Per-agent tool configuration and version records
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Record that `config.service` now runs with `config`
    async fn set_config(&self, agent: &AgentId, config: &ServiceConfig) -> Result<(), StoreError>;

    /// Forget the configuration of `service`
    async fn remove_config(&self, agent: &AgentId, service: &str) -> Result<(), StoreError>;

    /// Replace every configuration recorded for the agent
    async fn replace_all(&self, agent: &AgentId, configs: &[ServiceConfig]) -> Result<(), StoreError>;

    /// Record the agent version
    async fn record_version(&self, agent: &AgentId, version: &VersionInfo) -> Result<(), StoreError>;
}

/// Sink for query-metric reports
#[async_trait]
pub trait ReportWriter: Send + Sync {
    /// Persist one report
    async fn write_report(&self, agent: &AgentId, report: &Report) -> Result<(), WriteError>;
}

/// Sink for agent log entries
#[async_trait]
pub trait LogWriter: Send + Sync {
    /// Persist a batch of entries in arrival order
    async fn write_logs(&self, agent: &AgentId, entries: &[LogEntry]) -> Result<(), WriteError>;
}
