//! Caller-facing handle for one connected agent

use crate::agent::AgentProcessor;
use crate::multiplexer::{MuxConfig, Multiplexer};
use crate::store::ConfigStore;
use crate::MuxError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use telemux_proto::{AgentId, Command, Reply};
use telemux_transport::Transport;

/// One remote agent as seen by the rest of the server
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Start the session
    async fn start(&self) -> Result<(), MuxError>;

    /// Stop the session; idempotent
    async fn stop(&self);

    /// Wait until the session has stopped
    async fn done(&self);

    /// Liveness probe used by the directory sweep
    async fn is_alive(&self) -> bool;

    /// Send a command and wait for the agent's reply
    async fn send(&self, command: Command) -> Result<Reply, MuxError>;
}

/// [`Communicator`] backed by a single-worker [`Multiplexer`] running an
/// [`AgentProcessor`]
pub struct AgentCommunicator {
    mux: Multiplexer<AgentProcessor>,
    liveness_window: Option<Duration>,
}

impl AgentCommunicator {
    /// Create a stopped communicator for `agent_id` over `transport`.
    ///
    /// The session label is set to the agent ID. Fails if `config` asks for
    /// more than one dispatch worker.
    pub fn new(
        agent_id: impl Into<AgentId>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ConfigStore>,
        config: MuxConfig,
    ) -> Result<Self, MuxError> {
        let agent_id = agent_id.into();
        let config = config.with_name(agent_id.as_str());
        let processor = AgentProcessor::new(agent_id, store);
        Ok(Self {
            mux: Multiplexer::new(processor, transport, config)?,
            liveness_window: None,
        })
    }

    /// Also report the agent dead when nothing arrived from it for `window`
    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = Some(window);
        self
    }

    /// Agent identity
    pub fn agent_id(&self) -> &AgentId {
        self.mux.processor().agent_id()
    }

    /// Underlying multiplexer
    pub fn multiplexer(&self) -> &Multiplexer<AgentProcessor> {
        &self.mux
    }
}

#[async_trait]
impl Communicator for AgentCommunicator {
    async fn start(&self) -> Result<(), MuxError> {
        self.mux.start().await
    }

    async fn stop(&self) {
        self.mux.stop().await
    }

    async fn done(&self) {
        self.mux.done().await
    }

    async fn is_alive(&self) -> bool {
        if !self.mux.is_running() {
            return false;
        }
        match self.liveness_window {
            Some(window) => self.mux.processor().last_seen().elapsed() <= window,
            None => true,
        }
    }

    async fn send(&self, command: Command) -> Result<Reply, MuxError> {
        self.mux.send(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;
    use telemux_proto::{FrameCodec, ServiceConfig, VersionInfo};
    use telemux_transport::{StreamTransport, TransportConfig};
    use tokio::io::DuplexStream;

    struct NullStore;

    #[async_trait]
    impl ConfigStore for NullStore {
        async fn set_config(&self, _: &AgentId, _: &ServiceConfig) -> Result<(), StoreError> {
            Ok(())
        }
        async fn remove_config(&self, _: &AgentId, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn replace_all(&self, _: &AgentId, _: &[ServiceConfig]) -> Result<(), StoreError> {
            Ok(())
        }
        async fn record_version(&self, _: &AgentId, _: &VersionInfo) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn communicator(config: MuxConfig) -> Result<(AgentCommunicator, DuplexStream), MuxError> {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let transport = Arc::new(StreamTransport::from_stream(local, TransportConfig::default()));
        let comm = AgentCommunicator::new("agent-7", transport, Arc::new(NullStore), config)?;
        Ok((comm, peer))
    }

    #[tokio::test]
    async fn test_rejects_concurrent_dispatch() {
        let result = communicator(MuxConfig::default().with_concurrency(4));
        assert!(matches!(result, Err(MuxError::Config(_))));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (comm, _peer) = communicator(MuxConfig::default()).unwrap();
        assert_eq!(comm.agent_id().as_str(), "agent-7");
        assert_eq!(comm.multiplexer().config().name, "agent-7");
        assert!(!comm.is_alive().await);

        comm.start().await.unwrap();
        assert!(comm.is_alive().await);

        comm.stop().await;
        comm.done().await;
        assert!(!comm.is_alive().await);
    }

    #[tokio::test]
    async fn test_send_version() {
        let (comm, mut peer) = communicator(MuxConfig::default()).unwrap();
        comm.start().await.unwrap();

        let agent = tokio::spawn(async move {
            let mut codec = FrameCodec::new();
            let frame = codec.read_frame(&mut peer).await.unwrap().unwrap();
            let command = Command::from_msgpack(&frame).unwrap();
            let reply = command.reply(r#"{"running":"2.1.0"}"#);
            codec.write_frame(&mut peer, &reply.to_msgpack().unwrap()).await.unwrap();
            peer
        });

        let reply = comm.send(Command::new("agent-7", "agent", "Version")).await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(&reply.data[..], br#"{"running":"2.1.0"}"#);
        let _peer = agent.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_agent_goes_stale() {
        let (comm, _peer) = communicator(MuxConfig::default()).unwrap();
        let comm = comm.with_liveness_window(Duration::from_secs(60));
        comm.start().await.unwrap();
        assert!(comm.is_alive().await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!comm.is_alive().await);
    }
}
