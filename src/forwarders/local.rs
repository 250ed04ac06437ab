//! LocalForwarder (§4.3) and, by reuse, InternalForwarder (§4.6) — the
//! latter is identical in mechanics, it just happens to target a host
//! that only resolves from the SSH server's side of the network.

use super::{peer_originator, SharedError, SpawnedForwarder};
use crate::bytepump::{relay, TrafficCounters};
use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::transport::Session;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

/// Binds `bind_host:bind_port` and, for every accepted connection, opens a
/// `direct-tcpip` channel to `remote_host:remote_port` over `session` and
/// relays bytes between the two.
#[allow(clippy::too_many_arguments)]
pub async fn spawn(
    forwarder_id: String,
    bind_host: String,
    bind_port: u16,
    remote_host: String,
    remote_port: u16,
    session: Session,
    events: EventBus,
    last_error: SharedError,
) -> Result<SpawnedForwarder> {
    let listener = TcpListener::bind((bind_host.as_str(), bind_port))
        .await
        .map_err(|e| EngineError::from_bind_io(&bind_host, bind_port, e))?;
    let actual_bind_port = listener.local_addr().map(|a| a.port()).unwrap_or(bind_port);

    let active = Arc::new(AtomicBool::new(true));
    let counters = Arc::new(TrafficCounters::default());
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let (cancel_tx, _) = broadcast::channel::<()>(1);

    events.forwarder_active(&forwarder_id);

    let task_active = active.clone();
    let task_counters = counters.clone();
    let task_events = events.clone();
    let task_id = forwarder_id.clone();
    let task_cancel_tx = cancel_tx.clone();
    let task_last_error = last_error.clone();

    let task = tokio::spawn(async move {
        let mut disconnect_rx = session.subscribe_disconnect();
        let mut connections = JoinSet::new();
        let mut exit_error: Option<String> = None;
        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = disconnect_rx.recv() => {
                    exit_error = Some("owning session disconnected".into());
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(forwarder = %task_id, error = %e, "accept failed");
                            continue;
                        }
                    };
                    let session = session.clone();
                    let remote_host = remote_host.clone();
                    let counters = task_counters.clone();
                    let events = task_events.clone();
                    let id = task_id.clone();
                    let cancel_rx = task_cancel_tx.subscribe();
                    let last_error = task_last_error.clone();
                    connections.spawn(async move {
                        let (origin_host, origin_port) = peer_originator(peer);
                        match session
                            .open_direct_tcpip(&remote_host, remote_port, &origin_host, origin_port)
                            .await
                        {
                            Ok(channel) => relay(stream, channel, id, counters, events, cancel_rx).await,
                            Err(e) => {
                                tracing::warn!(forwarder = %id, error = %e, "direct-tcpip open failed");
                                *last_error.lock().unwrap() = Some(format!("direct-tcpip open failed: {}", e));
                            }
                        }
                    });
                }
            }
        }
        while connections.join_next().await.is_some() {}
        if let Some(reason) = &exit_error {
            *task_last_error.lock().unwrap() = Some(reason.clone());
        }
        task_active.store(false, Ordering::SeqCst);
        task_events.forwarder_inactive(&task_id, exit_error);
    });

    Ok(SpawnedForwarder {
        actual_bind_port,
        active,
        stop_tx,
        cancel_tx,
        task,
        counters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn occupied_bind_port_is_unavailable() {
        // spawn() maps this same bind failure through EngineError::from_bind_io
        // (see error.rs's bind_io_maps_addr_in_use); a live Session is needed
        // to exercise spawn() itself, which belongs in an integration test
        // against a real or embedded SSH server.
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let occupied_port = holder.local_addr().unwrap().port();
        let result = TcpListener::bind(("127.0.0.1", occupied_port)).await;
        assert!(result.is_err());
    }
}
