use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// The four forwarding kinds the engine understands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingKind {
    Local,
    Remote,
    Dynamic,
    Internal,
}

impl ForwardingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Dynamic => "dynamic",
            Self::Internal => "internal",
        }
    }
}

/// The flat persisted shape consumed from the config collaborator (`connections.json`).
/// Pure data — no runtime handles — per the separation the teacher's dict-shaped
/// records lacked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardingRule {
    #[serde(rename = "type")]
    pub kind: ForwardingKind,
    #[serde(default)]
    pub local_host: String,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
    /// `dynamic` only: SOCKS5 listener bind address/port.
    #[serde(default)]
    pub bind_host: String,
    #[serde(default)]
    pub bind_port: u16,
    /// `internal` only: target resolvable only from the SSH server's network.
    #[serde(default)]
    pub internal_host: String,
    #[serde(default)]
    pub internal_port: u16,
    #[serde(default)]
    pub active: bool,
}

/// Typed, per-kind config the ForwarderRegistry actually starts — derived
/// from a `ForwardingRule` once validated. Keeping this separate from
/// `ForwardingRule` is what lets the runtime state (§4.2 Forwarder) hold a
/// config payload without re-parsing the persisted dict shape on every use.
#[derive(Debug, Clone)]
pub enum ForwardConfig {
    Local(LocalForwardConfig),
    Remote(RemoteForwardConfig),
    Dynamic(DynamicForwardConfig),
    Internal(LocalForwardConfig),
}

#[derive(Debug, Clone)]
pub struct LocalForwardConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

#[derive(Debug, Clone)]
pub struct RemoteForwardConfig {
    pub remote_host: String,
    pub remote_port: u16,
    pub local_host: String,
    pub local_port: u16,
}

#[derive(Debug, Clone)]
pub struct DynamicForwardConfig {
    pub bind_host: String,
    pub bind_port: u16,
}

impl ForwardConfig {
    pub fn kind(&self) -> ForwardingKind {
        match self {
            Self::Local(_) => ForwardingKind::Local,
            Self::Remote(_) => ForwardingKind::Remote,
            Self::Dynamic(_) => ForwardingKind::Dynamic,
            Self::Internal(_) => ForwardingKind::Internal,
        }
    }

    /// Bind host/port used to compute the registry identity. For `remote`
    /// this is the requested remote bind, which may be rewritten later if
    /// `remote_port == 0` (§4.4 edge case).
    pub fn bind_host_port(&self) -> (&str, u16) {
        match self {
            Self::Local(c) | Self::Internal(c) => (&c.bind_host, c.bind_port),
            Self::Remote(c) => (&c.remote_host, c.remote_port),
            Self::Dynamic(c) => (&c.bind_host, c.bind_port),
        }
    }

    /// `"{type}:{bind_host}:{bind_port}"` per §3's Forwarder identity.
    pub fn identity(&self) -> String {
        let (host, port) = self.bind_host_port();
        format!("{}:{}:{}", self.kind().as_str(), host, port)
    }
}

impl TryFrom<&ForwardingRule> for ForwardConfig {
    type Error = EngineError;

    fn try_from(rule: &ForwardingRule) -> Result<Self> {
        match rule.kind {
            ForwardingKind::Local => {
                if rule.remote_host.is_empty() {
                    return Err(EngineError::config("local rule missing remote_host"));
                }
                Ok(Self::Local(LocalForwardConfig {
                    bind_host: non_empty_or(&rule.local_host, "127.0.0.1"),
                    bind_port: rule.local_port,
                    remote_host: rule.remote_host.clone(),
                    remote_port: rule.remote_port,
                }))
            }
            ForwardingKind::Remote => {
                if rule.local_host.is_empty() {
                    return Err(EngineError::config("remote rule missing local_host"));
                }
                Ok(Self::Remote(RemoteForwardConfig {
                    remote_host: non_empty_or(&rule.remote_host, "0.0.0.0"),
                    remote_port: rule.remote_port,
                    local_host: rule.local_host.clone(),
                    local_port: rule.local_port,
                }))
            }
            ForwardingKind::Dynamic => Ok(Self::Dynamic(DynamicForwardConfig {
                bind_host: non_empty_or(&rule.bind_host, "127.0.0.1"),
                bind_port: rule.bind_port,
            })),
            ForwardingKind::Internal => {
                if rule.internal_host.is_empty() {
                    return Err(EngineError::config("internal rule missing internal_host"));
                }
                Ok(Self::Internal(LocalForwardConfig {
                    bind_host: non_empty_or(&rule.local_host, "127.0.0.1"),
                    bind_port: rule.local_port,
                    remote_host: rule.internal_host.clone(),
                    remote_port: rule.internal_port,
                }))
            }
        }
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_rule() -> ForwardingRule {
        ForwardingRule {
            kind: ForwardingKind::Local,
            local_host: "127.0.0.1".into(),
            local_port: 18000,
            remote_host: "127.0.0.1".into(),
            remote_port: 19000,
            bind_host: String::new(),
            bind_port: 0,
            internal_host: String::new(),
            internal_port: 0,
            active: true,
        }
    }

    #[test]
    fn local_identity_matches_type_bind_host_port() {
        let cfg = ForwardConfig::try_from(&local_rule()).unwrap();
        assert_eq!(cfg.identity(), "local:127.0.0.1:18000");
    }

    #[test]
    fn internal_identity_uses_internal_prefix() {
        let mut rule = local_rule();
        rule.kind = ForwardingKind::Internal;
        rule.internal_host = "10.0.0.5".into();
        rule.internal_port = 80;
        let cfg = ForwardConfig::try_from(&rule).unwrap();
        assert_eq!(cfg.identity(), "internal:127.0.0.1:18000");
        match cfg {
            ForwardConfig::Internal(c) => {
                assert_eq!(c.remote_host, "10.0.0.5");
                assert_eq!(c.remote_port, 80);
            }
            _ => panic!("expected Internal"),
        }
    }

    #[test]
    fn remote_rule_rejects_missing_local_host() {
        let mut rule = local_rule();
        rule.kind = ForwardingKind::Remote;
        rule.local_host = String::new();
        assert!(ForwardConfig::try_from(&rule).is_err());
    }

    #[test]
    fn dynamic_rule_defaults_bind_host() {
        let rule = ForwardingRule {
            kind: ForwardingKind::Dynamic,
            local_host: String::new(),
            local_port: 0,
            remote_host: String::new(),
            remote_port: 0,
            bind_host: String::new(),
            bind_port: 11080,
            internal_host: String::new(),
            internal_port: 0,
            active: true,
        };
        let cfg = ForwardConfig::try_from(&rule).unwrap();
        assert_eq!(cfg.identity(), "dynamic:127.0.0.1:11080");
    }
}
