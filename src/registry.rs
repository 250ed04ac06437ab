//! ForwarderRegistry (§4.2): owns every Forwarder's config and, once
//! started, its running handle. Mirrors TransportRegistry's emit-after-
//! releasing-the-lock discipline so a slow event observer can never hold
//! up an Add/Start/Stop call.

use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::forwarders::{dynamic, local, new_shared_error, remote, SharedError, SpawnedForwarder};
use crate::model::forwarding::{ForwardConfig, ForwardingKind};
use crate::port_guard::PortGuard;
use crate::transport::Session;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A point-in-time view of one Forwarder, returned by `status`/`list`
/// (§4.2, §11 per-forwarder status snapshot).
#[derive(Debug, Clone)]
pub struct ForwarderStatus {
    pub id: String,
    pub kind: ForwardingKind,
    pub session_identity: String,
    pub active: bool,
    pub bind_port: u16,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connection_count: u64,
    pub active_connections: u64,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

struct ForwarderEntry {
    config: ForwardConfig,
    session_identity: String,
    created_at: DateTime<Utc>,
    runtime: Option<SpawnedForwarder>,
    /// Survives across a restart of the same identity; cloned into the
    /// running Forwarder so a live Connection can record a failure
    /// without going back through the registry's map lock (§4.2, §7).
    last_error: SharedError,
}

pub struct ForwarderRegistry {
    forwarders: RwLock<HashMap<String, ForwarderEntry>>,
    port_guard: PortGuard,
    events: EventBus,
}

impl ForwarderRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            forwarders: RwLock::new(HashMap::new()),
            port_guard: PortGuard::new(),
            events,
        }
    }

    /// §4.2 `Add`. Registers a validated, stopped Forwarder. Fails if a
    /// Forwarder with the same identity already exists, or if a different
    /// kind already reserved the same bind address (Remote is exempt: it
    /// never binds locally).
    pub async fn add(&self, config: ForwardConfig, session_identity: impl Into<String>) -> Result<String> {
        let identity = config.identity();

        if !matches!(config, ForwardConfig::Remote(_)) {
            let (host, port) = config.bind_host_port();
            self.port_guard.reserve(host, port).await?;
        }

        let mut forwarders = self.forwarders.write().await;
        if forwarders.contains_key(&identity) {
            let (host, port) = config.bind_host_port();
            if !matches!(config, ForwardConfig::Remote(_)) {
                self.port_guard.release(host, port).await;
            }
            return Err(EngineError::duplicate(identity));
        }
        forwarders.insert(
            identity.clone(),
            ForwarderEntry {
                config,
                session_identity: session_identity.into(),
                created_at: Utc::now(),
                runtime: None,
                last_error: new_shared_error(),
            },
        );
        Ok(identity)
    }

    /// §4.2 `Start`. Spawns the forwarder's listener/route against
    /// `session`. On `remote_port == 0`, rewrites the stored identity to
    /// the server-assigned port and returns the new identity (§4.4 edge
    /// case) — the caller must use the returned identity for subsequent
    /// Stop/Remove/Status calls.
    pub async fn start(&self, identity: &str, session: Session) -> Result<String> {
        let (config, last_error) = {
            let forwarders = self.forwarders.read().await;
            let entry = forwarders.get(identity).ok_or_else(|| EngineError::not_found(identity))?;
            if entry.runtime.is_some() {
                return Err(EngineError::duplicate(identity));
            }
            (entry.config.clone(), entry.last_error.clone())
        };

        let runtime = match self.spawn_runtime(identity, &config, session, last_error.clone()).await {
            Ok(runtime) => runtime,
            Err(e) => {
                *last_error.lock().unwrap() = Some(e.to_string());
                return Err(e);
            }
        };
        *last_error.lock().unwrap() = None;
        let actual_port = runtime.actual_bind_port;

        let mut forwarders = self.forwarders.write().await;
        let mut entry = forwarders
            .remove(identity)
            .ok_or_else(|| EngineError::not_found(identity))?;

        let final_identity = if matches!(config, ForwardConfig::Remote(ref c) if c.remote_port == 0) {
            rewritten_identity(identity, actual_port)
        } else {
            identity.to_string()
        };

        entry.runtime = Some(runtime);
        forwarders.insert(final_identity.clone(), entry);
        drop(forwarders);

        self.events.forwarder_active(&final_identity);
        Ok(final_identity)
    }

    async fn spawn_runtime(
        &self,
        identity: &str,
        config: &ForwardConfig,
        session: Session,
        last_error: SharedError,
    ) -> Result<SpawnedForwarder> {
        match config {
            ForwardConfig::Local(c) => {
                local::spawn(
                    identity.to_string(),
                    c.bind_host.clone(),
                    c.bind_port,
                    c.remote_host.clone(),
                    c.remote_port,
                    session,
                    self.events.clone(),
                    last_error,
                )
                .await
            }
            ForwardConfig::Internal(c) => {
                local::spawn(
                    identity.to_string(),
                    c.bind_host.clone(),
                    c.bind_port,
                    c.remote_host.clone(),
                    c.remote_port,
                    session,
                    self.events.clone(),
                    last_error,
                )
                .await
            }
            ForwardConfig::Dynamic(c) => {
                dynamic::spawn(
                    identity.to_string(),
                    c.bind_host.clone(),
                    c.bind_port,
                    session,
                    self.events.clone(),
                    last_error,
                )
                .await
            }
            ForwardConfig::Remote(c) => {
                remote::spawn(
                    identity.to_string(),
                    c.remote_host.clone(),
                    c.remote_port,
                    c.local_host.clone(),
                    c.local_port,
                    session,
                    self.events.clone(),
                    last_error,
                )
                .await
            }
        }
    }

    /// §4.2 `Stop`. Idempotent: stopping an already-stopped forwarder is a
    /// no-op rather than an error, matching `Session::shutdown_transport`'s
    /// idempotence.
    pub async fn stop(&self, identity: &str) -> Result<()> {
        let runtime = {
            let mut forwarders = self.forwarders.write().await;
            let entry = forwarders.get_mut(identity).ok_or_else(|| EngineError::not_found(identity))?;
            entry.runtime.take()
        };
        if let Some(runtime) = runtime {
            runtime.stop().await;
            self.events.forwarder_inactive(identity, None);
        }
        Ok(())
    }

    /// §4.2 `Remove`. Requires the forwarder be stopped first.
    pub async fn remove(&self, identity: &str) -> Result<()> {
        let mut forwarders = self.forwarders.write().await;
        let entry = forwarders.get(identity).ok_or_else(|| EngineError::not_found(identity))?;
        if entry.runtime.is_some() {
            return Err(EngineError::config(format!("{} must be stopped before removal", identity)));
        }
        if !matches!(entry.config, ForwardConfig::Remote(_)) {
            let (host, port) = entry.config.bind_host_port();
            self.port_guard.release(host, port).await;
        }
        forwarders.remove(identity);
        Ok(())
    }

    pub async fn status(&self, identity: &str) -> Result<ForwarderStatus> {
        let forwarders = self.forwarders.read().await;
        let entry = forwarders.get(identity).ok_or_else(|| EngineError::not_found(identity))?;
        Ok(build_status(identity, entry))
    }

    pub async fn list(&self) -> Vec<ForwarderStatus> {
        let forwarders = self.forwarders.read().await;
        forwarders.iter().map(|(id, entry)| build_status(id, entry)).collect()
    }

    /// Every Forwarder currently owned by `session_identity`, used by the
    /// top-level coordinator when tearing down a Session (§9).
    pub async fn identities_for_session(&self, session_identity: &str) -> Vec<String> {
        let forwarders = self.forwarders.read().await;
        forwarders
            .iter()
            .filter(|(_, entry)| entry.session_identity == session_identity)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn build_status(identity: &str, entry: &ForwarderEntry) -> ForwarderStatus {
    let (bytes_sent, bytes_received, connection_count, active_connections) = entry
        .runtime
        .as_ref()
        .map(|r| r.counters.snapshot())
        .unwrap_or((0, 0, 0, 0));
    let active = entry
        .runtime
        .as_ref()
        .map(|r| r.active.load(std::sync::atomic::Ordering::SeqCst))
        .unwrap_or(false);
    let bind_port = entry
        .runtime
        .as_ref()
        .map(|r| r.actual_bind_port)
        .unwrap_or_else(|| entry.config.bind_host_port().1);

    ForwarderStatus {
        id: identity.to_string(),
        kind: entry.config.kind(),
        session_identity: entry.session_identity.clone(),
        active,
        bind_port,
        bytes_sent,
        bytes_received,
        connection_count,
        active_connections,
        created_at: entry.created_at,
        last_error: entry.last_error.lock().unwrap().clone(),
    }
}

fn rewritten_identity(identity: &str, actual_port: u16) -> String {
    match identity.rsplit_once(':') {
        Some((prefix, _)) => format!("{}:{}", prefix, actual_port),
        None => identity.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::forwarding::LocalForwardConfig;

    fn local_config(port: u16) -> ForwardConfig {
        ForwardConfig::Local(LocalForwardConfig {
            bind_host: "127.0.0.1".into(),
            bind_port: port,
            remote_host: "127.0.0.1".into(),
            remote_port: 9999,
        })
    }

    #[tokio::test]
    async fn add_rejects_duplicate_identity() {
        let registry = ForwarderRegistry::new(EventBus::new());
        registry.add(local_config(18001), "h:22:u").await.unwrap();
        let result = registry.add(local_config(18001), "h:22:u").await;
        assert!(matches!(result, Err(EngineError::Duplicate { .. })));
    }

    #[tokio::test]
    async fn remove_of_never_started_forwarder_succeeds_immediately() {
        let registry = ForwarderRegistry::new(EventBus::new());
        let id = registry.add(local_config(18002), "h:22:u").await.unwrap();
        // Never started: runtime is None, remove should succeed immediately.
        registry.remove(&id).await.unwrap();
        assert!(registry.status(&id).await.is_err());
    }

    #[tokio::test]
    async fn remove_releases_the_bind_port_for_reuse() {
        let registry = ForwarderRegistry::new(EventBus::new());
        let id = registry.add(local_config(18005), "h:22:u").await.unwrap();
        registry.remove(&id).await.unwrap();
        // Same host:port, different kind: only possible if the guard released it.
        let reused = ForwardConfig::Dynamic(crate::model::forwarding::DynamicForwardConfig {
            bind_host: "127.0.0.1".into(),
            bind_port: 18005,
        });
        registry.add(reused, "h:22:u").await.unwrap();
    }

    #[tokio::test]
    async fn identities_for_session_filters_correctly() {
        let registry = ForwarderRegistry::new(EventBus::new());
        registry.add(local_config(18003), "a:22:u").await.unwrap();
        registry.add(local_config(18004), "b:22:u").await.unwrap();
        let ids = registry.identities_for_session("a:22:u").await;
        assert_eq!(ids, vec!["local:127.0.0.1:18003".to_string()]);
    }

    #[tokio::test]
    async fn status_on_unknown_identity_fails() {
        let registry = ForwarderRegistry::new(EventBus::new());
        let result = registry.status("nonexistent").await;
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }
}
