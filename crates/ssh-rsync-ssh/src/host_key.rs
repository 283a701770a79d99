//! Host key verification policy

use crate::TransportError;
use ssh_key::{HashAlg, PublicKey};

/// How the remote host key is checked when the password session is opened
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept whatever key the host presents and pin it for the rest of the session
    #[default]
    TrustOnFirstUse,
    /// Require a matching entry in an OpenSSH known_hosts file
    KnownHosts(std::path::PathBuf),
    /// Require the key's SHA-256 fingerprint, as printed by `ssh-keygen -l`
    Pinned(String),
}

/// Host key presented by the remote server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    key: PublicKey,
}

impl HostKey {
    /// Parse the raw key blob sent during the handshake
    pub fn from_bytes(blob: &[u8]) -> Result<Self, TransportError> {
        let key = PublicKey::from_bytes(blob)?;
        Ok(Self { key })
    }

    /// Wrap an already parsed public key
    pub fn from_public_key(key: PublicKey) -> Self {
        Self { key }
    }

    /// `SHA256:<base64>` fingerprint
    pub fn fingerprint(&self) -> String {
        self.key.fingerprint(HashAlg::Sha256).to_string()
    }

    /// Compare against a user supplied fingerprint, with or without the
    /// `SHA256:` prefix and base64 padding.
    pub fn matches_fingerprint(&self, expected: &str) -> bool {
        let normalize = |s: &str| {
            let s = s.trim();
            let s = s.strip_prefix("SHA256:").unwrap_or(s);
            s.trim_end_matches('=').to_string()
        };
        normalize(&self.fingerprint()) == normalize(expected)
    }

    /// A known_hosts line pinning this key for `host:port`
    pub fn known_hosts_line(&self, host: &str, port: u16) -> Result<String, TransportError> {
        let pattern = if port == 22 {
            host.to_string()
        } else {
            format!("[{}]:{}", host, port)
        };
        Ok(format!("{} {}", pattern, self.key.to_openssh()?))
    }
}
