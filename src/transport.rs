//! TransportRegistry (§4.1): owns SSH sessions keyed by (host, port, user).

use crate::error::{EngineError, Result};
use crate::events::EventBus;
use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, Disconnect};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

/// A channel opened by the SSH server for a previously-registered
/// `tcpip-forward` (§4.4). Routed from the `client::Handler` callback to
/// whichever RemoteForwarder owns that bound port.
pub struct InboundForward {
    pub channel: Channel<Msg>,
    pub originator_address: String,
    pub originator_port: u32,
}

type InboundRoutes = Arc<RwLock<HashMap<u16, mpsc::UnboundedSender<InboundForward>>>>;

/// Pluggable host-key trust policy (§4.1, §9). Default is accept-all,
/// matching the teacher's behavior; `Strict` is the upgrade hook the
/// surrounding application can install without touching the core.
pub trait HostKeyPolicy: Send + Sync {
    /// Returns true if `fingerprint` (SHA256, as rendered by `ssh_key`) is trusted.
    fn check(&self, fingerprint: &str) -> bool;
}

pub struct AcceptAllHostKeys;

impl HostKeyPolicy for AcceptAllHostKeys {
    fn check(&self, _fingerprint: &str) -> bool {
        true
    }
}

pub struct StrictHostKeyPolicy {
    pub expected_fingerprint: String,
}

impl HostKeyPolicy for StrictHostKeyPolicy {
    fn check(&self, fingerprint: &str) -> bool {
        fingerprint == self.expected_fingerprint
    }
}

/// `russh::client::Handler` implementation. Thin by design: host-key
/// trust is delegated to a `HostKeyPolicy`, and inbound forwarded-tcpip
/// channels are routed to whichever RemoteForwarder registered that port
/// rather than handled inline.
#[derive(Clone)]
struct ClientHandler {
    identity: String,
    policy: Arc<dyn HostKeyPolicy>,
    inbound_routes: InboundRoutes,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        use russh::keys::ssh_key::HashAlg;
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        let policy = self.policy.clone();
        let identity = self.identity.clone();
        async move {
            let trusted = policy.check(&fingerprint);
            if trusted {
                tracing::debug!(session = %identity, %fingerprint, "host key accepted");
            } else {
                tracing::error!(session = %identity, %fingerprint, "host key rejected");
            }
            Ok(trusted)
        }
    }

    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send {
        let connected_address = connected_address.to_string();
        let originator_address = originator_address.to_string();
        let routes = self.inbound_routes.clone();
        async move {
            let route = routes.read().await.get(&(connected_port as u16)).cloned();
            match route {
                Some(tx) => {
                    let forward = InboundForward {
                        channel,
                        originator_address,
                        originator_port,
                    };
                    tx.send(forward).map_err(|_| russh::Error::Disconnect)
                }
                None => {
                    tracing::warn!(
                        address = %connected_address,
                        port = connected_port,
                        "no RemoteForwarder registered for inbound channel"
                    );
                    Err(russh::Error::Disconnect)
                }
            }
        }
    }
}

type SshHandle = Handle<ClientHandler>;

/// A live, authenticated SSH session. Cheap to clone — every clone shares
/// the same underlying transport and routing tables. A Forwarder holds a
/// `Session` as a non-owning reference (§9: ids + lookups, not
/// bidirectional owning pointers — the owning copy lives only in the
/// TransportRegistry's map).
#[derive(Clone)]
pub struct Session {
    pub identity: String,
    handle: Arc<Mutex<SshHandle>>,
    inbound_routes: InboundRoutes,
    disconnect_tx: broadcast::Sender<()>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl Session {
    /// Opens a `direct-tcpip` channel to `(host, port)` with the given
    /// originator address (§4.3, §4.5, §4.6).
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>> {
        let handle = self.handle.lock().await;
        handle
            .channel_open_direct_tcpip(host, port as u32, originator_address, originator_port)
            .await
            .map_err(|e| EngineError::channel(e.to_string()))
    }

    /// Requests the server listen on `(addr, port)` and forward inbound
    /// connections back to us (§4.4). Returns the actual bound port — may
    /// differ from the request when `port == 0`.
    pub async fn tcpip_forward(&self, addr: &str, port: u16) -> Result<u16> {
        let mut handle = self.handle.lock().await;
        handle
            .tcpip_forward(addr, port as u32)
            .await
            .map(|actual| actual as u16)
            .map_err(|e| EngineError::channel(e.to_string()))
    }

    pub async fn cancel_tcpip_forward(&self, addr: &str, port: u16) -> Result<()> {
        let handle = self.handle.lock().await;
        handle
            .cancel_tcpip_forward(addr, port as u32)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::channel(e.to_string()))
    }

    /// Registers where inbound forwarded-tcpip channels for `bound_port`
    /// should be routed. Called by RemoteForwarder right after a
    /// successful `tcpip_forward`.
    pub async fn register_inbound_route(&self, bound_port: u16) -> mpsc::UnboundedReceiver<InboundForward> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inbound_routes.write().await.insert(bound_port, tx);
        rx
    }

    pub async fn unregister_inbound_route(&self, bound_port: u16) {
        self.inbound_routes.write().await.remove(&bound_port);
    }

    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn shutdown_transport(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return; // idempotent
        }
        let handle = self.handle.lock().await;
        let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
        let _ = self.disconnect_tx.send(());
    }
}

struct SessionEntry {
    session: Session,
    keepalive_task: Option<JoinHandle<()>>,
}

/// Owns every live SSH Session, keyed by `"{host}:{port}:{username}"`.
pub struct TransportRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    events: EventBus,
}

/// Options narrowing `Connect`'s behavior (§4.1).
pub struct ConnectOptions {
    pub password: Option<String>,
    pub key_path: Option<std::path::PathBuf>,
    pub passphrase: Option<String>,
    pub keep_alive_interval_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub host_key_policy: Arc<dyn HostKeyPolicy>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            password: None,
            key_path: None,
            passphrase: None,
            keep_alive_interval_seconds: 60,
            connect_timeout_seconds: 10,
            host_key_policy: Arc::new(AcceptAllHostKeys),
        }
    }
}

impl TransportRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn identity(host: &str, port: u16, username: &str) -> String {
        format!("{}:{}:{}", host, port, username)
    }

    /// §4.1 `Connect`. Dials, authenticates (public key first if provided
    /// and readable, else password), registers the session, fires
    /// `session.up`.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        username: &str,
        opts: ConnectOptions,
    ) -> Result<Session> {
        let identity = Self::identity(host, port, username);

        if self.sessions.read().await.contains_key(&identity) {
            return Err(EngineError::already_exists(identity));
        }

        let inbound_routes: InboundRoutes = Arc::new(RwLock::new(HashMap::new()));
        let handler = ClientHandler {
            identity: identity.clone(),
            policy: opts.host_key_policy.clone(),
            inbound_routes: inbound_routes.clone(),
        };

        let config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            ..<client::Config as Default>::default()
        };

        let connect_fut = client::connect(Arc::new(config), (host, port), handler);
        let mut handle = tokio::time::timeout(
            Duration::from_secs(opts.connect_timeout_seconds),
            connect_fut,
        )
        .await
        .map_err(|_| EngineError::network(host, port, "connect timed out"))?
        .map_err(|e| EngineError::network(host, port, e.to_string()))?;

        authenticate(&mut handle, username, &opts)
            .await
            .map_err(|e| {
                tracing::warn!(%identity, error = %e, "authentication failed");
                e
            })?;

        let (disconnect_tx, _) = broadcast::channel(8);
        let session = Session {
            identity: identity.clone(),
            handle: Arc::new(Mutex::new(handle)),
            inbound_routes,
            disconnect_tx,
            closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };

        let keepalive_task = spawn_keepalive(
            session.clone(),
            self.events.clone(),
            opts.keep_alive_interval_seconds,
        );

        self.sessions.write().await.insert(
            identity.clone(),
            SessionEntry {
                session: session.clone(),
                keepalive_task,
            },
        );

        self.events.session_up(&identity);
        tracing::info!(%identity, "session established");
        Ok(session)
    }

    /// §4.1 `Disconnect`. Idempotent; forwarder teardown is the caller's
    /// responsibility (the engine-level coordinator stops forwarders
    /// before calling this — see `Engine::disconnect_session`).
    pub async fn disconnect(&self, identity: &str) {
        let entry = self.sessions.write().await.remove(identity);
        let Some(entry) = entry else { return };
        if let Some(task) = entry.keepalive_task {
            task.abort();
        }
        entry.session.shutdown_transport().await;
        self.events.session_down(identity, None);
        tracing::info!(%identity, "session disconnected");
    }

    pub async fn get(&self, identity: &str) -> Option<Session> {
        self.sessions.read().await.get(identity).map(|e| e.session.clone())
    }

    pub async fn list(&self) -> Vec<Session> {
        self.sessions.read().await.values().map(|e| e.session.clone()).collect()
    }
}

async fn authenticate(handle: &mut SshHandle, username: &str, opts: &ConnectOptions) -> Result<()> {
    if let Some(key_path) = &opts.key_path {
        if key_path_readable(key_path).await {
            return authenticate_pubkey(handle, username, key_path, opts.passphrase.as_deref()).await;
        }
    }
    if let Some(password) = &opts.password {
        return authenticate_password(handle, username, password).await;
    }
    Err(EngineError::auth(
        "",
        0,
        "no usable credential: neither a readable key_path nor a password was supplied",
    ))
}

async fn key_path_readable(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

async fn authenticate_password(handle: &mut SshHandle, username: &str, password: &str) -> Result<()> {
    let result = handle
        .authenticate_password(username, password)
        .await
        .map_err(|e| EngineError::auth(username, 0, e.to_string()))?;
    match result {
        AuthResult::Success => Ok(()),
        _ => Err(EngineError::auth(username, 0, "password authentication rejected")),
    }
}

async fn authenticate_pubkey(
    handle: &mut SshHandle,
    username: &str,
    key_path: &Path,
    passphrase: Option<&str>,
) -> Result<()> {
    let key_data = tokio::fs::read_to_string(key_path)
        .await
        .map_err(|e| EngineError::auth(username, 0, format!("reading key file: {}", e)))?;

    let key = PrivateKey::from_openssh(key_data.trim())
        .map_err(|e| EngineError::auth(username, 0, format!("parsing key: {}", e)))?;
    let key = match passphrase {
        Some(pass) => key
            .decrypt(pass.as_bytes())
            .map_err(|e| EngineError::auth(username, 0, format!("decrypting key: {}", e)))?,
        None => key,
    };

    let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);
    let result = handle
        .authenticate_publickey(username, key_with_alg)
        .await
        .map_err(|e| EngineError::auth(username, 0, e.to_string()))?;
    match result {
        AuthResult::Success => Ok(()),
        _ => Err(EngineError::auth(username, 0, "public key authentication rejected")),
    }
}

/// Keep-alive monitor (§4.1). `russh`'s client `Handle` does not expose a
/// bare no-op wire keepalive on this API surface, so liveness is
/// approximated the way the teacher's remote-forward monitor does it:
/// poll `is_closed()` every interval, treating two consecutive closed
/// observations as the "missed response for two intervals" trigger.
fn spawn_keepalive(session: Session, events: EventBus, interval_seconds: u64) -> Option<JoinHandle<()>> {
    if interval_seconds == 0 {
        return None;
    }
    let missed = Arc::new(AtomicU32::new(0));
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));
        loop {
            ticker.tick().await;
            if session.is_closed() {
                break;
            }
            if session.handle.lock().await.is_closed() {
                let count = missed.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= 2 {
                    tracing::warn!(identity = %session.identity, "keep-alive missed twice, marking session down");
                    events.session_down(&session.identity, Some("keep-alive timeout".into()));
                    session.shutdown_transport().await;
                    break;
                }
            } else {
                missed.store(0, Ordering::SeqCst);
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_all_trusts_anything() {
        let policy = AcceptAllHostKeys;
        assert!(policy.check("anything"));
    }

    #[test]
    fn strict_only_trusts_expected_fingerprint() {
        let policy = StrictHostKeyPolicy {
            expected_fingerprint: "SHA256:abc".into(),
        };
        assert!(policy.check("SHA256:abc"));
        assert!(!policy.check("SHA256:def"));
    }

    #[tokio::test]
    async fn connect_without_credentials_fails_fast() {
        // No listener on this port: dial fails before credential checks even
        // matter, but this exercises the Connect() error path end to end.
        let registry = TransportRegistry::new(EventBus::new());
        let opts = ConnectOptions {
            connect_timeout_seconds: 1,
            ..ConnectOptions::default()
        };
        let result = registry.connect("127.0.0.1", 1, "nobody", opts).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn disconnect_unknown_identity_is_noop() {
        let registry = TransportRegistry::new(EventBus::new());
        registry.disconnect("nonexistent:22:nobody").await;
    }

    #[tokio::test]
    async fn key_path_readable_reflects_filesystem_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");
        tokio::fs::write(&path, "placeholder").await.unwrap();

        assert!(key_path_readable(&path).await);
        assert!(!key_path_readable(&dir.path().join("missing")).await);
    }

    #[test]
    fn malformed_key_file_fails_to_parse() {
        assert!(PrivateKey::from_openssh("not a real key").is_err());
    }
}
