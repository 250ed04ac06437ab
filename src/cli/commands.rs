use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tunnel_engine::model::forwarding::{ForwardingKind, ForwardingRule};

/// Thin demonstration shell over the tunnel engine. Never reads a key file
/// or prompts for a password itself — credentials are supplied already
/// materialized, via a flag or an environment variable.
#[derive(Parser, Debug)]
#[command(name = "tunnelctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a host and run one or more forwarders until interrupted.
    Run {
        /// SSH host
        #[arg(short = 'H', long)]
        host: String,

        /// SSH port
        #[arg(short, long, default_value_t = 22)]
        port: u16,

        /// SSH username
        #[arg(short, long)]
        username: String,

        /// Password (also read from TUNNEL_PASSWORD)
        #[arg(long, env = "TUNNEL_PASSWORD")]
        password: Option<String>,

        /// Private key path
        #[arg(long)]
        key: Option<PathBuf>,

        /// Private key passphrase (also read from TUNNEL_KEY_PASSPHRASE)
        #[arg(long, env = "TUNNEL_KEY_PASSPHRASE")]
        passphrase: Option<String>,

        /// One forwarder spec: `local:BIND_PORT:REMOTE_HOST:REMOTE_PORT`,
        /// `remote:REMOTE_PORT:LOCAL_HOST:LOCAL_PORT`,
        /// `dynamic:BIND_PORT`, or
        /// `internal:BIND_PORT:INTERNAL_HOST:INTERNAL_PORT`. Repeatable.
        #[arg(long = "forward", value_parser = parse_forward)]
        forwards: Vec<ForwardSpec>,

        /// Keep-alive probe interval in seconds, 0 disables.
        #[arg(long, default_value_t = 60)]
        keep_alive: u64,

        /// Connection timeout in seconds.
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,

        /// Accept any host key instead of the engine's default accept-all
        /// policy's quieter logging — kept for symmetry with future
        /// strict-mode wiring; currently a no-op flag.
        #[arg(long)]
        insecure: bool,
    },
}

/// A parsed `--forward` argument, convertible to a `ForwardingRule`.
#[derive(Debug, Clone)]
pub struct ForwardSpec {
    pub kind: ForwardingKind,
    pub bind_port: u16,
    pub peer_host: String,
    pub peer_port: u16,
}

impl ForwardSpec {
    pub fn into_rule(self) -> ForwardingRule {
        let mut rule = ForwardingRule {
            kind: self.kind,
            local_host: String::new(),
            local_port: 0,
            remote_host: String::new(),
            remote_port: 0,
            bind_host: String::new(),
            bind_port: 0,
            internal_host: String::new(),
            internal_port: 0,
            active: true,
        };
        match self.kind {
            ForwardingKind::Local => {
                rule.local_port = self.bind_port;
                rule.remote_host = self.peer_host;
                rule.remote_port = self.peer_port;
            }
            ForwardingKind::Remote => {
                rule.remote_port = self.bind_port;
                rule.local_host = self.peer_host;
                rule.local_port = self.peer_port;
            }
            ForwardingKind::Dynamic => {
                rule.bind_port = self.bind_port;
            }
            ForwardingKind::Internal => {
                rule.local_port = self.bind_port;
                rule.internal_host = self.peer_host;
                rule.internal_port = self.peer_port;
            }
        }
        rule
    }
}

fn parse_forward(s: &str) -> Result<ForwardSpec, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let kind = match parts.first() {
        Some(&"local") => ForwardingKind::Local,
        Some(&"remote") => ForwardingKind::Remote,
        Some(&"dynamic") => ForwardingKind::Dynamic,
        Some(&"internal") => ForwardingKind::Internal,
        _ => return Err(format!("unknown forward kind in '{}': expected local/remote/dynamic/internal", s)),
    };

    match kind {
        ForwardingKind::Dynamic => {
            let bind_port = parts
                .get(1)
                .ok_or_else(|| format!("'{}': expected dynamic:BIND_PORT", s))?
                .parse()
                .map_err(|e| format!("'{}': invalid bind port: {}", s, e))?;
            Ok(ForwardSpec { kind, bind_port, peer_host: String::new(), peer_port: 0 })
        }
        _ => {
            if parts.len() != 4 {
                return Err(format!("'{}': expected {}:PORT:HOST:PORT", s, parts[0]));
            }
            let bind_port = parts[1]
                .parse()
                .map_err(|e| format!("'{}': invalid port: {}", s, e))?;
            let peer_port = parts[3]
                .parse()
                .map_err(|e| format!("'{}': invalid port: {}", s, e))?;
            Ok(ForwardSpec {
                kind,
                bind_port,
                peer_host: parts[2].to_string(),
                peer_port,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_forward_spec() {
        let spec = parse_forward("local:8080:example.com:22").unwrap();
        assert_eq!(spec.kind, ForwardingKind::Local);
        assert_eq!(spec.bind_port, 8080);
        assert_eq!(spec.peer_host, "example.com");
        assert_eq!(spec.peer_port, 22);
    }

    #[test]
    fn parses_dynamic_forward_spec() {
        let spec = parse_forward("dynamic:1080").unwrap();
        assert_eq!(spec.kind, ForwardingKind::Dynamic);
        assert_eq!(spec.bind_port, 1080);
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(parse_forward("socks4:1080").is_err());
    }

    #[test]
    fn local_spec_round_trips_into_rule() {
        let spec = parse_forward("local:8080:example.com:22").unwrap();
        let rule = spec.into_rule();
        assert_eq!(rule.local_port, 8080);
        assert_eq!(rule.remote_host, "example.com");
        assert_eq!(rule.remote_port, 22);
    }
}
