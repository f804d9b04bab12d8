//! Shared fixtures for telemux integration tests
//!
//! An in-memory configuration store and a scripted agent that speaks the
//! command/reply protocol over any byte stream.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use telemux::proto::{verb, AgentId, Command, FrameCodec, Reply, ServiceConfig, VersionInfo};
use telemux::{ConfigStore, StoreError};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing_subscriber::EnvFilter;

/// Route test logs through the test harness; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Configuration store backed by maps
#[derive(Default)]
pub struct MemoryStore {
    configs: Mutex<BTreeMap<AgentId, BTreeMap<String, serde_json::Value>>>,
    versions: Mutex<BTreeMap<AgentId, VersionInfo>>,
}

impl MemoryStore {
    /// Configurations recorded for `agent`
    pub fn configs(&self, agent: &AgentId) -> BTreeMap<String, serde_json::Value> {
        self.configs.lock().unwrap().get(agent).cloned().unwrap_or_default()
    }

    /// Version recorded for `agent`
    pub fn version(&self, agent: &AgentId) -> Option<VersionInfo> {
        self.versions.lock().unwrap().get(agent).cloned()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn set_config(&self, agent: &AgentId, config: &ServiceConfig) -> Result<(), StoreError> {
        let mut configs = self.configs.lock().unwrap();
        configs
            .entry(agent.clone())
            .or_default()
            .insert(config.service.clone(), config.config.clone());
        Ok(())
    }

    async fn remove_config(&self, agent: &AgentId, service: &str) -> Result<(), StoreError> {
        let mut configs = self.configs.lock().unwrap();
        let removed = configs.get_mut(agent).and_then(|c| c.remove(service));
        match removed {
            Some(_) => Ok(()),
            None => Err(StoreError::UnknownAgent(agent.clone())),
        }
    }

    async fn replace_all(&self, agent: &AgentId, configs: &[ServiceConfig]) -> Result<(), StoreError> {
        let replacement = configs
            .iter()
            .map(|c| (c.service.clone(), c.config.clone()))
            .collect();
        self.configs.lock().unwrap().insert(agent.clone(), replacement);
        Ok(())
    }

    async fn record_version(&self, agent: &AgentId, version: &VersionInfo) -> Result<(), StoreError> {
        self.versions.lock().unwrap().insert(agent.clone(), version.clone());
        Ok(())
    }
}

/// Scripted agent
#[derive(Clone)]
pub struct FakeAgent {
    /// Reported by `Version`
    pub version: String,
    /// Reported by `GetAllConfigs`
    pub configs: Vec<ServiceConfig>,
    /// Send a keep-alive before every reply
    pub keepalive: bool,
}

impl Default for FakeAgent {
    fn default() -> Self {
        Self {
            version: "2.4.1".to_string(),
            configs: Vec::new(),
            keepalive: false,
        }
    }
}

impl FakeAgent {
    /// Reply the agent gives to `command`
    pub fn answer(&self, command: &Command) -> Reply {
        match command.cmd.as_str() {
            verb::VERSION => {
                let info = VersionInfo { running: self.version.clone(), installed: None };
                command.reply(serde_json::to_vec(&info).unwrap())
            }
            verb::GET_ALL_CONFIGS => command.reply(serde_json::to_vec(&self.configs).unwrap()),
            verb::START_TOOL | verb::STOP_TOOL => command.reply(""),
            other => command.reply_error(format!("unknown command {other}")),
        }
    }

    /// Answer commands until the server closes the stream; returns how many
    /// were answered
    pub async fn serve<S>(self, stream: S) -> anyhow::Result<usize>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut codec = FrameCodec::new();
        let mut served = 0;

        while let Some(frame) = codec.read_frame(&mut reader).await? {
            let command = Command::from_msgpack(&frame)?;
            if self.keepalive {
                codec.write_frame(&mut writer, &Reply::keepalive().to_msgpack()?).await?;
            }
            codec.write_frame(&mut writer, &self.answer(&command).to_msgpack()?).await?;
            served += 1;
        }
        Ok(served)
    }
}
