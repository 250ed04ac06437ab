use thiserror::Error;

/// Taxonomy of errors surfaced by the forwarding engine.
///
/// Each variant carries enough context to populate a Session's or
/// Forwarder's `last_error` without re-parsing a string.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("authentication refused by {host}:{port}: {reason}")]
    Auth {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("network error connecting to {host}:{port}: {reason}")]
    Network {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("failed to bind {bind_host}:{bind_port}: {reason}")]
    Bind {
        bind_host: String,
        bind_port: u16,
        reason: String,
    },

    #[error("SSH channel error: {reason}")]
    Channel { reason: String },

    #[error("SOCKS5 protocol error: {reason}")]
    Protocol { reason: String },

    #[error("forwarder already exists: {identity}")]
    Duplicate { identity: String },

    #[error("not found: {identity}")]
    NotFound { identity: String },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("session already exists: {identity}")]
    AlreadyExists { identity: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn auth(host: impl Into<String>, port: u16, reason: impl Into<String>) -> Self {
        Self::Auth {
            host: host.into(),
            port,
            reason: reason.into(),
        }
    }

    pub fn network(host: impl Into<String>, port: u16, reason: impl Into<String>) -> Self {
        Self::Network {
            host: host.into(),
            port,
            reason: reason.into(),
        }
    }

    pub fn bind(bind_host: impl Into<String>, bind_port: u16, reason: impl Into<String>) -> Self {
        Self::Bind {
            bind_host: bind_host.into(),
            bind_port,
            reason: reason.into(),
        }
    }

    pub fn channel(reason: impl Into<String>) -> Self {
        Self::Channel {
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn duplicate(identity: impl Into<String>) -> Self {
        Self::Duplicate {
            identity: identity.into(),
        }
    }

    pub fn not_found(identity: impl Into<String>) -> Self {
        Self::NotFound {
            identity: identity.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn already_exists(identity: impl Into<String>) -> Self {
        Self::AlreadyExists {
            identity: identity.into(),
        }
    }

    /// Map a listener-bind I/O error into the taxonomy's `Bind` variant,
    /// distinguishing the common OS-level causes.
    pub fn from_bind_io(bind_host: &str, bind_port: u16, err: std::io::Error) -> Self {
        let reason = match err.kind() {
            std::io::ErrorKind::AddrInUse => format!("address in use: {}", err),
            std::io::ErrorKind::PermissionDenied => format!("permission denied: {}", err),
            std::io::ErrorKind::AddrNotAvailable => format!("address not available: {}", err),
            _ => err.to_string(),
        };
        Self::bind(bind_host, bind_port, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_error_formats_identity() {
        let err = EngineError::duplicate("local:127.0.0.1:8000");
        assert_eq!(err.to_string(), "forwarder already exists: local:127.0.0.1:8000");
    }

    #[test]
    fn bind_io_maps_addr_in_use() {
        let io_err = std::io::Error::from(std::io::ErrorKind::AddrInUse);
        let err = EngineError::from_bind_io("127.0.0.1", 18000, io_err);
        assert!(matches!(err, EngineError::Bind { .. }));
        assert!(err.to_string().contains("in use"));
    }
}
