use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// SSH authentication method. The core receives already-materialized
/// credentials: this type never reads a key file or prompts a user, it
/// only carries the already-resolved path/flag for `TransportRegistry::connect`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMethod {
    /// Password authentication (the password itself is supplied out-of-band
    /// to `Connect`, never stored on this value).
    Password,
    /// Public key authentication.
    PublicKey {
        private_key_path: PathBuf,
        passphrase_required: bool,
    },
}

impl Default for AuthMethod {
    fn default() -> Self {
        Self::Password
    }
}

impl AuthMethod {
    pub fn is_password(&self) -> bool {
        matches!(self, Self::Password)
    }

    pub fn is_public_key(&self) -> bool {
        matches!(self, Self::PublicKey { .. })
    }

    pub fn public_key(path: impl Into<PathBuf>, passphrase_required: bool) -> Self {
        Self::PublicKey {
            private_key_path: path.into(),
            passphrase_required,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_password() {
        assert!(AuthMethod::default().is_password());
    }

    #[test]
    fn public_key_builder_round_trips() {
        let auth = AuthMethod::public_key("/home/user/.ssh/id_ed25519", true);
        let json = serde_json::to_string(&auth).unwrap();
        let back: AuthMethod = serde_json::from_str(&json).unwrap();
        assert_eq!(auth, back);
    }
}
