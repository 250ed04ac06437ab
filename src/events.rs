//! Broadcast fan-out of session/forwarder state and traffic events.
//!
//! Re-architected from the teacher's GUI signal/slot coupling into a
//! typed `tokio::sync::broadcast` bus: N observers subscribe independently,
//! delivery never blocks a producer (a BytePump in particular).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One of the three event kinds the engine publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A Session transitioned up or down.
    SessionState {
        identity: String,
        up: bool,
        error: Option<String>,
    },
    /// A Forwarder transitioned active or inactive.
    ForwarderState {
        forwarder_id: String,
        active: bool,
        error: Option<String>,
    },
    /// Incremental traffic accounting for a Forwarder.
    ForwarderTraffic {
        forwarder_id: String,
        sent_delta: u64,
        recv_delta: u64,
    },
}

/// Default channel depth. State events are never dropped under normal
/// load at this depth; traffic events are allowed to lag and the oldest
/// is dropped by `broadcast` itself once a receiver falls behind.
const CHANNEL_CAPACITY: usize = 1024;

/// Broadcast hub. Cheap to clone; every clone shares the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe a new observer. Each observer gets its own lagging
    /// receiver; a slow observer only drops its own backlog, never the
    /// bus's ability to keep delivering to others.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: EngineEvent) {
        // No receivers is not an error: events are fire-and-forget.
        let _ = self.tx.send(event);
    }

    pub fn session_up(&self, identity: impl Into<String>) {
        self.publish(EngineEvent::SessionState {
            identity: identity.into(),
            up: true,
            error: None,
        });
    }

    pub fn session_down(&self, identity: impl Into<String>, error: Option<String>) {
        self.publish(EngineEvent::SessionState {
            identity: identity.into(),
            up: false,
            error,
        });
    }

    pub fn forwarder_active(&self, forwarder_id: impl Into<String>) {
        self.publish(EngineEvent::ForwarderState {
            forwarder_id: forwarder_id.into(),
            active: true,
            error: None,
        });
    }

    pub fn forwarder_inactive(&self, forwarder_id: impl Into<String>, error: Option<String>) {
        self.publish(EngineEvent::ForwarderState {
            forwarder_id: forwarder_id.into(),
            active: false,
            error,
        });
    }

    pub fn forwarder_traffic(&self, forwarder_id: impl Into<String>, sent_delta: u64, recv_delta: u64) {
        if sent_delta == 0 && recv_delta == 0 {
            return;
        }
        self.publish(EngineEvent::ForwarderTraffic {
            forwarder_id: forwarder_id.into(),
            sent_delta,
            recv_delta,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_events_are_ordered_per_observer() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.forwarder_active("local:127.0.0.1:8000");
        bus.forwarder_traffic("local:127.0.0.1:8000", 5, 0);
        bus.forwarder_inactive("local:127.0.0.1:8000", None);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();

        assert!(matches!(first, EngineEvent::ForwarderState { active: true, .. }));
        assert!(matches!(second, EngineEvent::ForwarderTraffic { .. }));
        assert!(matches!(third, EngineEvent::ForwarderState { active: false, .. }));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.session_up("127.0.0.1:2222:t");
    }

    #[tokio::test]
    async fn zero_delta_traffic_is_not_published() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.forwarder_traffic("local:127.0.0.1:8000", 0, 0);
        bus.forwarder_active("local:127.0.0.1:8000");
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::ForwarderState { active: true, .. }));
    }
}
