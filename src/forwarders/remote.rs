//! RemoteForwarder (§4.4). Asks the SSH server to listen on our behalf
//! (`tcpip-forward`) and relays each inbound forwarded channel to a local
//! TCP target. Unlike Local/Dynamic there is no listener on our side to
//! own — the "accept loop" is the stream of `InboundForward` values routed
//! here by `transport::ClientHandler`.

use super::{SharedError, SpawnedForwarder};
use crate::bytepump::{relay, TrafficCounters};
use crate::error::Result;
use crate::events::EventBus;
use crate::transport::Session;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

/// Requests `tcpip-forward` for `remote_host:remote_port` (`remote_port ==
/// 0` lets the server pick; the caller is responsible for rewriting the
/// Forwarder's identity once `actual_bind_port` comes back — §4.4 edge
/// case). Every inbound channel is bridged to `local_host:local_port`.
#[allow(clippy::too_many_arguments)]
pub async fn spawn(
    forwarder_id: String,
    remote_host: String,
    remote_port: u16,
    local_host: String,
    local_port: u16,
    session: Session,
    events: EventBus,
    last_error: SharedError,
) -> Result<SpawnedForwarder> {
    let actual_bind_port = session.tcpip_forward(&remote_host, remote_port).await?;
    let mut inbound_rx = session.register_inbound_route(actual_bind_port).await;

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
    let teardown_session = session.clone();
    let teardown_host = remote_host.clone();

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
                forward = inbound_rx.recv() => {
                    let Some(forward) = forward else {
                        exit_error = Some("inbound route closed".into());
                        break;
                    };
                    let local_host = local_host.clone();
                    let counters = task_counters.clone();
                    let events = task_events.clone();
                    let id = task_id.clone();
                    let cancel_rx = task_cancel_tx.subscribe();
                    let last_error = task_last_error.clone();
                    connections.spawn(async move {
                        match TcpStream::connect((local_host.as_str(), local_port)).await {
                            Ok(stream) => relay(stream, forward.channel, id, counters, events, cancel_rx).await,
                            Err(e) => {
                                tracing::warn!(
                                    forwarder = %id,
                                    originator = %forward.originator_address,
                                    originator_port = forward.originator_port,
                                    error = %e,
                                    "dialing local forward target failed"
                                );
                                *last_error.lock().unwrap() = Some(format!("dialing local forward target failed: {}", e));
                            }
                        }
                    });
                }
            }
        }
        while connections.join_next().await.is_some() {}
        teardown_session.unregister_inbound_route(actual_bind_port).await;
        let _ = teardown_session.cancel_tcpip_forward(&teardown_host, actual_bind_port).await;
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
