//! BytePump (§4.7): relays bytes between a local TCP stream and an SSH
//! channel without ever holding the channel behind a mutex. Three tasks
//! share ownership of exactly one resource each — the channel, the local
//! reader half, the local writer half — and hand bytes across via bounded
//! mpsc channels, the way the upstream forwarding code splits this work.

use crate::events::EventBus;
use russh::{Channel, ChannelMsg};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

const RELAY_BUFFER_DEPTH: usize = 32;
const READ_CHUNK: usize = 4096;

/// Running totals for one forwarder, shared across all of its concurrent
/// connections (§4.2's per-forwarder aggregate counters).
#[derive(Default)]
pub struct TrafficCounters {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub connection_count: AtomicU64,
    pub active_connections: AtomicU64,
}

impl TrafficCounters {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
            self.connection_count.load(Ordering::Relaxed),
            self.active_connections.load(Ordering::Relaxed),
        )
    }
}

/// Relays one connection's lifetime: local TCP stream on one side, an
/// already-opened SSH channel on the other. Returns once either side
/// closes or `cancel` fires (the owning Forwarder was asked to stop —
/// §4.2 `Stop`, §5). Publishes periodic `forwarder.traffic` deltas
/// through `events` tagged with `forwarder_id`.
pub async fn relay(
    local: TcpStream,
    channel: Channel<russh::client::Msg>,
    forwarder_id: String,
    counters: Arc<TrafficCounters>,
    events: EventBus,
    mut cancel: broadcast::Receiver<()>,
) {
    counters.connection_count.fetch_add(1, Ordering::Relaxed);
    counters.active_connections.fetch_add(1, Ordering::Relaxed);

    let (local_read, local_write) = tokio::io::split(local);
    let (close_tx, _) = broadcast::channel::<()>(1);
    let (to_local_tx, to_local_rx) = mpsc::channel::<Vec<u8>>(RELAY_BUFFER_DEPTH);
    let (to_ssh_tx, to_ssh_rx) = mpsc::channel::<Vec<u8>>(RELAY_BUFFER_DEPTH);

    let reader = local_reader(local_read, to_ssh_tx, close_tx.clone());
    let writer = local_writer(local_write, to_local_rx, close_tx.clone());
    let io = ssh_io(channel, to_local_tx, to_ssh_rx, close_tx.clone(), counters.clone(), forwarder_id.clone(), events.clone());

    tokio::pin!(reader, writer, io);
    let (mut reader_done, mut writer_done, mut io_done, mut cancelled) = (false, false, false, false);
    while !(reader_done && writer_done && io_done) {
        tokio::select! {
            _ = &mut reader, if !reader_done => reader_done = true,
            _ = &mut writer, if !writer_done => writer_done = true,
            _ = &mut io, if !io_done => io_done = true,
            _ = cancel.recv(), if !cancelled => {
                cancelled = true;
                let _ = close_tx.send(());
            }
        }
    }

    counters.active_connections.fetch_sub(1, Ordering::Relaxed);
}

/// Reads from the local socket, forwards each chunk to the ssh_io task.
/// Exits on EOF, read error, or close signal.
async fn local_reader(
    mut read_half: ReadHalf<TcpStream>,
    to_ssh_tx: mpsc::Sender<Vec<u8>>,
    close_tx: broadcast::Sender<()>,
) {
    let mut close_rx = close_tx.subscribe();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if to_ssh_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
            _ = close_rx.recv() => break,
        }
    }
    let _ = close_tx.send(());
}

/// Writes chunks arriving from the ssh_io task out to the local socket.
async fn local_writer(
    mut write_half: WriteHalf<TcpStream>,
    mut to_local_rx: mpsc::Receiver<Vec<u8>>,
    close_tx: broadcast::Sender<()>,
) {
    let mut close_rx = close_tx.subscribe();
    loop {
        tokio::select! {
            chunk = to_local_rx.recv() => {
                match chunk {
                    Some(data) => {
                        if write_half.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = close_rx.recv() => break,
        }
    }
    let _ = close_tx.send(());
}

/// Sole owner of the SSH `Channel`. Pulls data destined for the remote
/// side from `to_ssh_rx` and writes it to the channel; reads data arriving
/// from the remote side and forwards it to `to_local_tx`. Periodically
/// publishes traffic deltas.
async fn ssh_io(
    mut channel: Channel<russh::client::Msg>,
    to_local_tx: mpsc::Sender<Vec<u8>>,
    mut to_ssh_rx: mpsc::Receiver<Vec<u8>>,
    close_tx: broadcast::Sender<()>,
    counters: Arc<TrafficCounters>,
    forwarder_id: String,
    events: EventBus,
) {
    let mut close_rx = close_tx.subscribe();
    loop {
        tokio::select! {
            outgoing = to_ssh_rx.recv() => {
                match outgoing {
                    Some(data) => {
                        let len = data.len() as u64;
                        if channel.data(&data[..]).await.is_err() {
                            break;
                        }
                        counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
                        events.forwarder_traffic(&forwarder_id, len, 0);
                    }
                    None => break,
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        let len = data.len() as u64;
                        if to_local_tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                        counters.bytes_received.fetch_add(len, Ordering::Relaxed);
                        events.forwarder_traffic(&forwarder_id, 0, len);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
            _ = close_rx.recv() => break,
        }
    }
    let _ = channel.close().await;
    let _ = close_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot_reflects_updates() {
        let counters = TrafficCounters::default();
        counters.bytes_sent.fetch_add(10, Ordering::Relaxed);
        counters.bytes_received.fetch_add(3, Ordering::Relaxed);
        counters.connection_count.fetch_add(1, Ordering::Relaxed);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);
        assert_eq!(counters.snapshot(), (10, 3, 1, 1));
    }
}
