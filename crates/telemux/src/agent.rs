//! Command/reply processor for agent sessions

use crate::processor::{Processor, Received};
use crate::store::ConfigStore;
use crate::ProcessError;
use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use telemux_proto::{verb, AgentId, Command, CorrelationId, ProtocolError, Reply, ServiceConfig, VersionInfo};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Keep-alive frames received from agents
pub const KEEPALIVE_TOTAL: &str = "telemux_keepalive_total";

/// Correlates commands with agent replies and applies their effects to a
/// [`ConfigStore`].
///
/// Replies must be applied in the order the agent sent them, so this processor
/// only runs on a single dispatch worker.
pub struct AgentProcessor {
    agent_id: AgentId,
    store: Arc<dyn ConfigStore>,
    outstanding: Mutex<HashMap<CorrelationId, Command>>,
    last_seen: Mutex<Instant>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AgentProcessor {
    /// Create a processor for `agent_id`
    pub fn new(agent_id: impl Into<AgentId>, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            agent_id: agent_id.into(),
            store,
            outstanding: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Agent this session talks to
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Commands sent and not yet answered
    pub fn outstanding_len(&self) -> usize {
        lock(&self.outstanding).len()
    }

    /// When the last decodable frame arrived (creation time if none yet)
    pub fn last_seen(&self) -> Instant {
        *lock(&self.last_seen)
    }

    /// Apply the effect of a successful reply
    async fn apply(&self, command: &Command, reply: &Reply) -> Result<(), ProcessError> {
        let agent = &self.agent_id;
        match command.cmd.as_str() {
            verb::START_TOOL => {
                let config: ServiceConfig = command.json()?;
                self.store.set_config(agent, &config).await?;
            }
            verb::STOP_TOOL => {
                let service =
                    std::str::from_utf8(&command.data).map_err(|e| ProtocolError::Decode(e.to_string()))?;
                self.store.remove_config(agent, service).await?;
            }
            verb::VERSION => {
                let version: VersionInfo = reply.json()?;
                self.store.record_version(agent, &version).await?;
            }
            verb::GET_ALL_CONFIGS => {
                let configs: Vec<ServiceConfig> = reply.json()?;
                self.store.replace_all(agent, &configs).await?;
            }
            other => trace!(agent = %agent, cmd = other, "No side effect for verb"),
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for AgentProcessor {
    type Request = Command;
    type Response = Reply;

    async fn before_send(&self, mut command: Command) -> Result<(CorrelationId, Bytes), ProcessError> {
        let id = *command.id.get_or_insert_with(CorrelationId::new);
        let bytes = command.to_msgpack()?;
        match lock(&self.outstanding).entry(id) {
            Entry::Occupied(_) => return Err(ProcessError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(command);
            }
        }
        Ok((id, Bytes::from(bytes)))
    }

    async fn after_recv(&self, frame: Bytes) -> Received<Reply> {
        let reply = match Reply::from_msgpack(&frame) {
            Ok(reply) => reply,
            Err(e) => return Received::Unroutable(e.into()),
        };
        *lock(&self.last_seen) = Instant::now();

        if reply.is_keepalive() {
            counter!(KEEPALIVE_TOTAL).increment(1);
            trace!(agent = %self.agent_id, "Keep-alive");
            return Received::Ignore;
        }

        let command = lock(&self.outstanding).remove(&reply.id);
        let Some(command) = command else {
            return Received::Unroutable(ProcessError::UnknownReply(reply.id));
        };

        if !reply.is_ok() {
            debug!(agent = %self.agent_id, id = %reply.id, cmd = %reply.cmd, "Agent reported failure: {}", reply.error);
            return Received::Reply { id: reply.id, value: reply, error: None };
        }

        let error = self.apply(&command, &reply).await.err();
        Received::Reply { id: reply.id, value: reply, error }
    }

    async fn timeout(&self, id: CorrelationId) {
        if lock(&self.outstanding).remove(&id).is_some() {
            debug!(agent = %self.agent_id, %id, "Dropped unanswered command");
        }
    }

    fn serial_dispatch(&self) -> bool {
        true
    }
}
