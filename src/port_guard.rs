//! Local bind-port reservation (§4.2, §4.3, §4.5, §4.6). The ForwarderRegistry's
//! identity map alone does not catch two different kinds fighting over the
//! same bind address — `local:127.0.0.1:8080` and `dynamic:127.0.0.1:8080`
//! are distinct map keys but the same OS-level listener slot. RemoteForwarder
//! never binds locally and is not tracked here.

use crate::error::{EngineError, Result};
use std::collections::HashSet;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct PortGuard {
    reserved: Mutex<HashSet<(String, u16)>>,
}

impl PortGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reserve(&self, host: &str, port: u16) -> Result<()> {
        let mut reserved = self.reserved.lock().await;
        let key = (host.to_string(), port);
        if reserved.contains(&key) {
            return Err(EngineError::bind(host, port, "already reserved by another forwarder"));
        }
        reserved.insert(key);
        Ok(())
    }

    pub async fn release(&self, host: &str, port: u16) {
        self.reserved.lock().await.remove(&(host.to_string(), port));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_reservation_of_same_port_fails() {
        let guard = PortGuard::new();
        guard.reserve("127.0.0.1", 8080).await.unwrap();
        let result = guard.reserve("127.0.0.1", 8080).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn release_frees_the_slot_for_reuse() {
        let guard = PortGuard::new();
        guard.reserve("127.0.0.1", 8080).await.unwrap();
        guard.release("127.0.0.1", 8080).await;
        guard.reserve("127.0.0.1", 8080).await.unwrap();
    }

    #[tokio::test]
    async fn distinct_hosts_do_not_collide() {
        let guard = PortGuard::new();
        guard.reserve("127.0.0.1", 8080).await.unwrap();
        guard.reserve("0.0.0.0", 8080).await.unwrap();
    }
}
