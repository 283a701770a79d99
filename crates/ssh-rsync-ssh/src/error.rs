//! SSH-specific error types

use crate::bootstrap::InstallStep;
use thiserror::Error;
use std::io;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// TCP connect or SSH handshake failure
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// Credentials were rejected by the remote host
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The remote host key did not satisfy the configured policy
    #[error("Host key rejected for {host}: {reason}")]
    HostKey {
        /// Host whose key was rejected
        host: String,
        /// Why the key was rejected
        reason: String,
    },

    /// A step of the authorized-keys installation failed
    #[error("Key installation failed at step '{step}' (exit code {code}): {message}")]
    KeyInstall {
        /// Step that failed
        step: InstallStep,
        /// Exit status reported by the remote shell
        code: i32,
        /// Remote stderr, or the local reason
        message: String,
    },

    /// Key generation or encoding error
    #[error("Key error: {0}")]
    Key(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Timeout error
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Anything the SSH library reported that fits no other category
    #[error("SSH error: {0}")]
    Ssh(String),
}

impl From<ssh_key::Error> for TransportError {
    fn from(err: ssh_key::Error) -> Self {
        Self::Key(err.to_string())
    }
}
