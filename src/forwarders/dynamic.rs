//! DynamicForwarder / SOCKS5 (§4.5). A minimal SOCKS5 state machine:
//! NOAUTH only, CONNECT only, IPv4/IPv6/domain address types.

use super::{peer_originator, SharedError, SpawnedForwarder};
use crate::bytepump::{relay, TrafficCounters};
use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::transport::Session;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_GENERAL_FAILURE: u8 = 0x01;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

#[allow(clippy::too_many_arguments)]
pub async fn spawn(
    forwarder_id: String,
    bind_host: String,
    bind_port: u16,
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
                    let counters = task_counters.clone();
                    let events = task_events.clone();
                    let id = task_id.clone();
                    let cancel_rx = task_cancel_tx.subscribe();
                    let last_error = task_last_error.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, session, id.clone(), counters, events, cancel_rx).await {
                            tracing::warn!(forwarder = %id, error = %e, "SOCKS5 connection failed");
                            *last_error.lock().unwrap() = Some(format!("SOCKS5 connection failed: {}", e));
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

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    mut stream: TcpStream,
    peer: std::net::SocketAddr,
    session: Session,
    forwarder_id: String,
    counters: Arc<TrafficCounters>,
    events: EventBus,
    cancel: broadcast::Receiver<()>,
) -> Result<()> {
    negotiate_auth(&mut stream).await?;
    let (host, port) = read_connect_request(&mut stream).await?;

    let (origin_host, origin_port) = peer_originator(peer);
    let channel = match session.open_direct_tcpip(&host, port, &origin_host, origin_port).await {
        Ok(channel) => channel,
        Err(e) => {
            send_reply(&mut stream, socks5::REP_HOST_UNREACHABLE).await?;
            return Err(e);
        }
    };

    send_reply(&mut stream, socks5::REP_SUCCESS).await?;
    relay(stream, channel, forwarder_id, counters, events, cancel).await;
    Ok(())
}

async fn negotiate_auth(stream: &mut TcpStream) -> Result<()> {
    let mut header = [0u8; 2];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| EngineError::protocol(format!("reading greeting: {}", e)))?;
    let (version, nmethods) = (header[0], header[1]);
    if version != socks5::VERSION {
        return Err(EngineError::protocol(format!("unsupported SOCKS version {}", version)));
    }
    let mut methods = vec![0u8; nmethods as usize];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(|e| EngineError::protocol(format!("reading auth methods: {}", e)))?;

    if methods.contains(&socks5::AUTH_NONE) {
        stream
            .write_all(&[socks5::VERSION, socks5::AUTH_NONE])
            .await
            .map_err(EngineError::Io)?;
        Ok(())
    } else {
        let _ = stream.write_all(&[socks5::VERSION, socks5::AUTH_NO_ACCEPTABLE]).await;
        Err(EngineError::protocol("client offered no acceptable auth method"))
    }
}

async fn read_connect_request(stream: &mut TcpStream) -> Result<(String, u16)> {
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| EngineError::protocol(format!("reading request header: {}", e)))?;
    let (version, cmd, _reserved, atyp) = (header[0], header[1], header[2], header[3]);

    if version != socks5::VERSION {
        return Err(EngineError::protocol(format!("unsupported SOCKS version {}", version)));
    }
    if cmd != socks5::CMD_CONNECT {
        let _ = send_reply(stream, socks5::REP_CMD_NOT_SUPPORTED).await;
        return Err(EngineError::protocol(format!("unsupported command {}", cmd)));
    }

    let host = match atyp {
        socks5::ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await.map_err(EngineError::Io)?;
            Ipv4Addr::from(octets).to_string()
        }
        socks5::ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await.map_err(EngineError::Io)?;
            let len = len_buf[0];
            if len == 0 {
                let _ = send_reply(stream, socks5::REP_ADDR_NOT_SUPPORTED).await;
                return Err(EngineError::protocol("zero-length domain name"));
            }
            let mut domain = vec![0u8; len as usize];
            stream.read_exact(&mut domain).await.map_err(EngineError::Io)?;
            String::from_utf8(domain).map_err(|e| EngineError::protocol(format!("invalid domain: {}", e)))?
        }
        socks5::ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await.map_err(EngineError::Io)?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            let _ = send_reply(stream, socks5::REP_ADDR_NOT_SUPPORTED).await;
            return Err(EngineError::protocol(format!("unsupported address type {}", other)));
        }
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await.map_err(EngineError::Io)?;
    let port = u16::from_be_bytes(port_buf);

    Ok((host, port))
}

async fn send_reply(stream: &mut TcpStream, rep: u8) -> Result<()> {
    let reply = [
        socks5::VERSION,
        rep,
        0x00,
        socks5::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await.map_err(EngineError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn rejects_non_connect_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut method_reply = [0u8; 2];
            stream.read_exact(&mut method_reply).await.unwrap();
            // BIND (0x02) instead of CONNECT.
            stream
                .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
                .await
                .unwrap();
            let mut reply = [0u8; 10];
            stream.read_exact(&mut reply).await.unwrap();
            reply
        });
        let (mut server_stream, _) = listener.accept().await.unwrap();
        negotiate_auth(&mut server_stream).await.unwrap();
        let result = read_connect_request(&mut server_stream).await;
        assert!(result.is_err());
        let reply = client.await.unwrap();
        assert_eq!(reply[1], socks5::REP_CMD_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn rejects_zero_length_domain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut method_reply = [0u8; 2];
            stream.read_exact(&mut method_reply).await.unwrap();
            stream
                .write_all(&[0x05, 0x01, 0x00, 0x03, 0x00, 0, 80])
                .await
                .unwrap();
            let mut reply = [0u8; 10];
            stream.read_exact(&mut reply).await.unwrap();
            reply
        });
        let (mut server_stream, _) = listener.accept().await.unwrap();
        negotiate_auth(&mut server_stream).await.unwrap();
        let result = read_connect_request(&mut server_stream).await;
        assert!(result.is_err());
        let reply = client.await.unwrap();
        assert_eq!(reply[1], socks5::REP_ADDR_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn parses_ipv4_connect_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut method_reply = [0u8; 2];
            stream.read_exact(&mut method_reply).await.unwrap();
            stream
                .write_all(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB])
                .await
                .unwrap();
        });
        let (mut server_stream, _) = listener.accept().await.unwrap();
        negotiate_auth(&mut server_stream).await.unwrap();
        let (host, port) = read_connect_request(&mut server_stream).await.unwrap();
        assert_eq!(host, "93.184.216.34");
        assert_eq!(port, 443);
        client.await.unwrap();
    }
}
