use super::forwarding::ForwardingRule;
use super::auth::AuthMethod;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A connection record as read from the config collaborator's
/// `connections.json` (§6). Pure data: the engine turns this into a
/// `TransportRegistry::connect` call plus a batch of `ForwarderRegistry::add`
/// calls, it never owns or mutates this record's storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConnection {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    pub name: String,
    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub username: String,

    #[serde(default)]
    pub auth_method: AuthMethod,

    #[serde(default)]
    pub forwarding_rules: Vec<ForwardingRule>,

    /// Keep-alive interval in seconds; 0 disables keep-alive (§4.1).
    #[serde(default = "default_keep_alive")]
    pub keep_alive_interval_seconds: u64,

    /// Connection timeout in seconds (§4.1, default 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    #[serde(default)]
    pub host_key_fingerprint: Option<String>,

    /// If false, any host key is accepted (§4.1, §9: insecure default,
    /// preserved for parity, pluggable via `HostKeyPolicy`).
    #[serde(default)]
    pub verify_host_key: bool,

    #[serde(default = "default_compression")]
    pub compression: bool,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_compression() -> bool {
    true
}

impl SshConnection {
    pub fn new(name: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            host: host.into(),
            port: default_ssh_port(),
            username: username.into(),
            auth_method: AuthMethod::default(),
            forwarding_rules: Vec::new(),
            keep_alive_interval_seconds: default_keep_alive(),
            connect_timeout_seconds: default_connect_timeout(),
            host_key_fingerprint: None,
            verify_host_key: false,
            compression: default_compression(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth_method(mut self, auth_method: AuthMethod) -> Self {
        self.auth_method = auth_method;
        self
    }

    pub fn with_rule(mut self, rule: ForwardingRule) -> Self {
        self.forwarding_rules.push(rule);
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn display_name(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// Identity string used as the TransportRegistry key (§3).
    pub fn session_identity(&self) -> String {
        format!("{}:{}:{}", self.host, self.port, self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_identity_is_host_port_user() {
        let conn = SshConnection::new("prod", "example.com", "deploy").with_port(2222);
        assert_eq!(conn.session_identity(), "example.com:2222:deploy");
    }

    #[test]
    fn defaults_match_spec() {
        let conn = SshConnection::new("t", "host", "user");
        assert_eq!(conn.port, 22);
        assert_eq!(conn.keep_alive_interval_seconds, 60);
        assert_eq!(conn.connect_timeout_seconds, 10);
        assert!(!conn.verify_host_key);
        assert!(conn.compression);
    }

    #[test]
    fn touch_advances_updated_at() {
        let mut conn = SshConnection::new("t", "host", "user");
        let before = conn.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        conn.touch();
        assert!(conn.updated_at > before);
    }
}
