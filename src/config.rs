//! Locates the config directory the embedding application's persistence
//! collaborator reads `connections.json` from (§10.3). This crate never
//! reads or writes that file itself — `SshConnection`/`ForwardingRule` in
//! `model` are the shapes the collaborator deserializes into — it only
//! resolves where the directory lives so callers and tests can point a
//! mock collaborator at a temp directory instead.

use directories::ProjectDirs;
use std::path::PathBuf;

/// OS-native config directory for the embedding application (e.g.
/// `~/.config/tunnel-engine` on Linux). `None` if the platform has no
/// resolvable home directory.
pub fn default_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "tunnelengine", "tunnel-engine").map(|dirs| dirs.config_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_dir_resolves_under_a_tunnel_engine_component() {
        let dir = default_config_dir().expect("a home directory should be resolvable in test environments");
        assert!(dir.to_string_lossy().contains("tunnel-engine"));
    }
}
