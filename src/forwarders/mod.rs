//! Per-kind forwarder implementations (§4.3–§4.6). Each `spawn` function
//! owns exactly one listener or one inbound-route registration and hands
//! connections off to `bytepump::relay`; all four return the same
//! `SpawnedForwarder` handle so `ForwarderRegistry` can manage them
//! uniformly.

pub mod dynamic;
pub mod local;
pub mod remote;

use crate::bytepump::TrafficCounters;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Shared slot for a Forwarder's most recent error (§4.2 `Status` ->
/// `lastError`, §7). Held by the `ForwarderEntry` across restarts and
/// cloned into the running task so both the accept/route loop and every
/// live Connection can record a failure without a round trip through the
/// registry's map lock.
pub type SharedError = Arc<Mutex<Option<String>>>;

pub fn new_shared_error() -> SharedError {
    Arc::new(Mutex::new(None))
}

/// Handle to a running forwarder's background task. `active` flips to
/// false the moment the task's accept/route loop exits, whatever the
/// cause (explicit stop, owning session going down, an unrecoverable
/// accept error) — `ForwarderRegistry::status` reads it directly rather
/// than polling the task. `cancel_tx` reaches every live Connection's
/// BytePump (§4.2 `Stop`: "closes every live Connection; cancels pump
/// work"); `task` itself only resolves once the accept/route loop *and*
/// every Connection it spawned have finished.
pub struct SpawnedForwarder {
    pub actual_bind_port: u16,
    pub active: Arc<AtomicBool>,
    pub stop_tx: mpsc::Sender<()>,
    pub cancel_tx: broadcast::Sender<()>,
    pub task: JoinHandle<()>,
    pub counters: Arc<TrafficCounters>,
}

impl SpawnedForwarder {
    /// Stops accepting/routing new Connections, cancels every live one,
    /// then waits for all of them — and the accept/route loop itself — to
    /// finish. Idempotent: a second stop on an already-stopped forwarder
    /// just observes the task has already finished.
    pub async fn stop(self) {
        let _ = self.cancel_tx.send(());
        let _ = self.stop_tx.send(()).await;
        let _ = self.task.await;
    }
}

fn peer_originator(peer: std::net::SocketAddr) -> (String, u32) {
    (peer.ip().to_string(), peer.port() as u32)
}
