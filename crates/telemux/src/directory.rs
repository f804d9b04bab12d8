//! Registry of connected agents
//!
//! A reader/writer-locked map from agent identity to its [`Communicator`].
//! Registration of one identity is serialized by a per-identity lock so that
//! unrelated agents never wait on each other; lookups only take the shared
//! lock. A periodic sweep evicts communicators whose liveness probe fails.

use crate::communicator::Communicator;
use crate::DirectoryError;
use async_trait::async_trait;
use metrics::gauge;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use telemux_proto::AgentId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Number of registered agents
pub const AGENTS_CONNECTED: &str = "telemux_agents_connected";

/// Lookup and lifecycle operations on connected agents
#[async_trait]
pub trait AgentFinder: Send + Sync {
    /// Register `comm` for `id`. A live registration is kept and the call
    /// fails; a dead one is stopped and replaced.
    async fn add(&self, id: AgentId, comm: Arc<dyn Communicator>) -> Result<(), DirectoryError>;

    /// Unregister `id`, returning what was registered
    async fn remove(&self, id: &AgentId) -> Option<Arc<dyn Communicator>>;

    /// Communicator registered for `id`
    async fn get(&self, id: &AgentId) -> Option<Arc<dyn Communicator>>;

    /// Evict every registration whose liveness probe fails, giving up on the
    /// scan after `time_limit`
    async fn refresh(&self, time_limit: Duration) -> Sweep;
}

/// Outcome of one liveness sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sweep {
    /// Registrations probed
    pub checked: usize,
    /// Agents removed
    pub evicted: Vec<AgentId>,
    /// False if the time limit cut the scan short
    pub complete: bool,
}

struct Registration {
    comm: Arc<dyn Communicator>,
    registered_at: SystemTime,
}

/// In-memory [`AgentFinder`]
#[derive(Default)]
pub struct Directory {
    agents: RwLock<HashMap<AgentId, Registration>>,
    /// Per-identity registration locks, pruned when idle
    registering: Mutex<HashMap<AgentId, Arc<AsyncMutex<()>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Identity comparison that ignores vtable addresses
fn same(a: &Arc<dyn Communicator>, b: &Arc<dyn Communicator>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl Directory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered agents
    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Whether no agent is registered
    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    /// Registered identities, sorted
    pub async fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<_> = self.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// When `id` was registered
    pub async fn registered_at(&self, id: &AgentId) -> Option<SystemTime> {
        self.agents.read().await.get(id).map(|r| r.registered_at)
    }

    /// Sweep every `interval` until `cancel` fires
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, time_limit: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(?interval, "Starting agent liveness sweeper");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let sweep = self.refresh(time_limit).await;
                    if !sweep.evicted.is_empty() {
                        info!(evicted = sweep.evicted.len(), "Evicted dead agents");
                    }
                }
            }
        }

        debug!("Agent liveness sweeper stopped");
    }

    async fn lock_identity(&self, id: &AgentId) -> OwnedMutexGuard<()> {
        let slot = Arc::clone(lock(&self.registering).entry(id.clone()).or_default());
        slot.lock_owned().await
    }

    fn release_identity(&self, id: &AgentId) {
        let mut registering = lock(&self.registering);
        if registering.get(id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            registering.remove(id);
        }
    }

    async fn add_locked(&self, id: &AgentId, comm: Arc<dyn Communicator>) -> Result<(), DirectoryError> {
        let existing = self.agents.read().await.get(id).map(|r| Arc::clone(&r.comm));
        if let Some(existing) = existing {
            if existing.is_alive().await {
                warn!(agent = %id, "Rejecting duplicate connection");
                return Err(DirectoryError::DuplicateAgent(id.clone()));
            }
        }

        let replaced = {
            let mut agents = self.agents.write().await;
            let registration = Registration { comm, registered_at: SystemTime::now() };
            let replaced = agents.insert(id.clone(), registration);
            gauge!(AGENTS_CONNECTED).set(agents.len() as f64);
            replaced
        };

        match replaced {
            Some(stale) => {
                info!(agent = %id, "Replacing stale connection");
                stale.comm.stop().await;
            }
            None => info!(agent = %id, "Agent connected"),
        }
        Ok(())
    }
}

#[async_trait]
impl AgentFinder for Directory {
    async fn add(&self, id: AgentId, comm: Arc<dyn Communicator>) -> Result<(), DirectoryError> {
        let guard = self.lock_identity(&id).await;
        let result = self.add_locked(&id, comm).await;
        drop(guard);
        self.release_identity(&id);
        result
    }

    async fn remove(&self, id: &AgentId) -> Option<Arc<dyn Communicator>> {
        let mut agents = self.agents.write().await;
        let removed = agents.remove(id).map(|r| r.comm);
        gauge!(AGENTS_CONNECTED).set(agents.len() as f64);
        if removed.is_some() {
            debug!(agent = %id, "Agent removed");
        }
        removed
    }

    async fn get(&self, id: &AgentId) -> Option<Arc<dyn Communicator>> {
        self.agents.read().await.get(id).map(|r| Arc::clone(&r.comm))
    }

    async fn refresh(&self, time_limit: Duration) -> Sweep {
        let started = Instant::now();
        let deadline = started + time_limit;
        let mut sweep = Sweep { complete: true, ..Sweep::default() };
        let mut dead = Vec::new();

        {
            let agents = self.agents.read().await;
            let total = agents.len();
            for (id, registration) in agents.iter() {
                let alive = match timeout_at(deadline, registration.comm.is_alive()).await {
                    Ok(alive) => alive,
                    Err(_) => {
                        sweep.complete = false;
                        break;
                    }
                };
                sweep.checked += 1;
                if !alive {
                    dead.push((id.clone(), Arc::clone(&registration.comm)));
                }
            }

            if sweep.complete {
                debug!(checked = sweep.checked, dead = dead.len(), elapsed = ?started.elapsed(), "Liveness sweep finished");
            } else {
                warn!(checked = sweep.checked, total, dead = dead.len(), ?time_limit, "Liveness sweep aborted at time limit");
            }
        }

        if dead.is_empty() {
            return sweep;
        }

        let evicted = {
            let mut agents = self.agents.write().await;
            let mut evicted = Vec::with_capacity(dead.len());
            for (id, comm) in dead {
                // Skip entries replaced since the scan
                if agents.get(&id).is_some_and(|r| same(&r.comm, &comm)) {
                    agents.remove(&id);
                    evicted.push((id, comm));
                }
            }
            gauge!(AGENTS_CONNECTED).set(agents.len() as f64);
            evicted
        };

        for (id, comm) in evicted {
            info!(agent = %id, "Evicting dead agent");
            comm.stop().await;
            sweep.evicted.push(id);
        }
        sweep
    }
}
