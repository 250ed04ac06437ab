//! Managed SSH port-forwarding engine: a `TransportRegistry` of live SSH
//! sessions, a `ForwarderRegistry` of local/remote/dynamic/internal
//! forwarders running over them, and an `EventBus` fanning out state and
//! traffic changes to whatever observer wants them (a CLI, a GUI, a
//! metrics scraper).

pub mod bytepump;
pub mod config;
pub mod error;
pub mod events;
pub mod forwarders;
pub mod model;
pub mod port_guard;
pub mod registry;
pub mod transport;
pub mod utils;

pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBus};
pub use model::{AuthMethod, ForwardConfig, ForwardingKind, ForwardingRule, SshConnection};
pub use registry::{ForwarderRegistry, ForwarderStatus};
pub use transport::{AcceptAllHostKeys, ConnectOptions, HostKeyPolicy, Session, StrictHostKeyPolicy, TransportRegistry};

use std::sync::Arc;

/// Top-level coordinator combining both registries behind one EventBus.
/// This is the layer that knows Sessions own Forwarders (§9): the
/// registries themselves only know ids and lookups, `Engine` is where the
/// cross-registry orchestration (disconnecting a session stops its
/// forwarders first) lives.
#[derive(Clone)]
pub struct Engine {
    pub transport: Arc<TransportRegistry>,
    pub forwarders: Arc<ForwarderRegistry>,
    pub events: EventBus,
}

impl Engine {
    pub fn new() -> Self {
        let events = EventBus::new();
        Self {
            transport: Arc::new(TransportRegistry::new(events.clone())),
            forwarders: Arc::new(ForwarderRegistry::new(events.clone())),
            events,
        }
    }

    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        username: &str,
        opts: ConnectOptions,
    ) -> Result<Session> {
        self.transport.connect(host, port, username, opts).await
    }

    pub async fn add_forwarder(&self, config: ForwardConfig, session_identity: impl Into<String>) -> Result<String> {
        self.forwarders.add(config, session_identity).await
    }

    pub async fn start_forwarder(&self, identity: &str, session: Session) -> Result<String> {
        self.forwarders.start(identity, session).await
    }

    /// §4.1/§9 `Disconnect`: best-effort stop of every Forwarder owned by
    /// this session, then tear down the transport. Forwarder stop failures
    /// are logged, never block the transport from going down.
    pub async fn disconnect_session(&self, session_identity: &str) {
        let owned = self.forwarders.identities_for_session(session_identity).await;
        for identity in owned {
            if let Err(e) = self.forwarders.stop(&identity).await {
                tracing::warn!(forwarder = %identity, error = %e, "failed to stop forwarder during session teardown");
            }
            let _ = self.forwarders.remove(&identity).await;
        }
        self.transport.disconnect(session_identity).await;
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnect_unknown_session_is_a_noop() {
        let engine = Engine::new();
        engine.disconnect_session("nonexistent:22:nobody").await;
    }

    #[tokio::test]
    async fn add_forwarder_without_a_session_is_allowed_until_start() {
        let engine = Engine::new();
        let config = ForwardConfig::Dynamic(model::forwarding::DynamicForwardConfig {
            bind_host: "127.0.0.1".into(),
            bind_port: 19050,
        });
        let id = engine.add_forwarder(config, "host:22:user").await.unwrap();
        assert_eq!(id, "dynamic:127.0.0.1:19050");
    }
}
