//! Command and reply envelopes exchanged with agents

use crate::ProtocolError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Verb understood by agents
pub mod verb {
    /// Start a tool with the configuration carried in the command data
    pub const START_TOOL: &str = "StartTool";
    /// Stop the tool named by the command data
    pub const STOP_TOOL: &str = "StopTool";
    /// Report the agent version
    pub const VERSION: &str = "Version";
    /// Report every tool configuration the agent is running
    pub const GET_ALL_CONFIGS: &str = "GetAllConfigs";
    /// Unsolicited keep-alive sent by the agent; never answers a command
    pub const KEEPALIVE: &str = "Pong";
}

/// Correlation token linking a [`Command`] to its [`Reply`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh random ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a remote collection agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create an agent identity
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identity as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Command sent from the server to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Creation time in Unix milliseconds
    pub ts: u64,
    /// User that issued the command
    pub user: String,
    /// Target service on the agent
    pub service: String,
    /// Verb
    pub cmd: String,
    /// Opaque payload
    pub data: Bytes,
    /// Correlation ID. `None` until a sender assigns one; a command built with
    /// [`Command::with_id`] keeps its ID when relayed.
    pub id: Option<CorrelationId>,
    /// Agent the command is addressed to or relayed from
    pub agent_id: AgentId,
}

impl Command {
    /// Create a command with no payload and no correlation ID
    pub fn new(agent_id: impl Into<AgentId>, service: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            ts: unix_millis(),
            user: String::new(),
            service: service.into(),
            cmd: cmd.into(),
            data: Bytes::new(),
            id: None,
            agent_id: agent_id.into(),
        }
    }

    /// Attach an opaque payload
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Attach a JSON payload
    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self, ProtocolError> {
        let data = serde_json::to_vec(value).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(self.with_data(data))
    }

    /// Record the issuing user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Pin the correlation ID, e.g. when relaying a command on behalf of
    /// another session
    pub fn with_id(mut self, id: CorrelationId) -> Self {
        self.id = Some(id);
        self
    }

    /// Whether this is the keep-alive sentinel
    pub fn is_keepalive(&self) -> bool {
        self.cmd == verb::KEEPALIVE
    }

    /// Build a successful reply to this command
    pub fn reply(&self, data: impl Into<Bytes>) -> Reply {
        Reply {
            id: self.id.unwrap_or_default(),
            cmd: self.cmd.clone(),
            data: data.into(),
            error: String::new(),
        }
    }

    /// Build a failed reply to this command
    pub fn reply_error(&self, error: impl Into<String>) -> Reply {
        Reply {
            id: self.id.unwrap_or_default(),
            cmd: self.cmd.clone(),
            data: Bytes::new(),
            error: error.into(),
        }
    }

    /// Decode the payload as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.data)?)
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

/// Reply sent from an agent for exactly one [`Command`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Correlation ID echoed from the command
    pub id: CorrelationId,
    /// Verb echoed from the command
    pub cmd: String,
    /// Success payload
    pub data: Bytes,
    /// Agent-reported failure; empty means success
    pub error: String,
}

impl Reply {
    /// Keep-alive pseudo-reply; answers no command
    pub fn keepalive() -> Self {
        Self {
            id: CorrelationId::new(),
            cmd: verb::KEEPALIVE.to_string(),
            data: Bytes::new(),
            error: String::new(),
        }
    }

    /// Whether the agent reported success
    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }

    /// Whether this is the keep-alive sentinel
    pub fn is_keepalive(&self) -> bool {
        self.cmd == verb::KEEPALIVE
    }

    /// Split into payload or agent-reported error
    pub fn into_result(self) -> Result<Bytes, String> {
        if self.error.is_empty() {
            Ok(self.data)
        } else {
            Err(self.error)
        }
    }

    /// Decode the payload as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.data)?)
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

/// Tool configuration carried by `StartTool` and `GetAllConfigs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service (tool) name
    pub service: String,
    /// Tool-specific configuration document
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Payload of a `Version` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Version of the running agent
    pub running: String,
    /// Version installed on disk, if it differs
    #[serde(default)]
    pub installed: Option<String>,
}

pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
