//! Error types for ssh-rsync

use ssh_rsync_ssh::{InstallStep, TransportError};
use thiserror::Error;

/// Main error type for ssh-rsync operations
#[derive(Debug, Error)]
pub enum RsyncError {
    /// The remote host rejected the credentials
    #[error("Authentication failed, check the user name and password: {0}")]
    Auth(String),

    /// The SSH service could not be reached or the handshake failed
    #[error("Cannot connect to the remote host, the SSH service may be down: {0}")]
    Connect(String),

    /// Key installation stopped part way
    #[error("Failed to install the session key at step '{step}' (exit code {code}): {message}")]
    KeyInstall {
        /// Step that failed
        step: InstallStep,
        /// Exit status of the remote command
        code: i32,
        /// Remote error output
        message: String,
    },

    /// The destination directory does not exist on the remote host
    #[error("Destination path does not exist on the remote host: {path}")]
    NotFound {
        /// Destination that was checked
        path: String,
    },

    /// The destination check itself could not be carried out
    #[error("Could not verify the destination path {path}: {reason}")]
    CheckFailed {
        /// Destination that was checked
        path: String,
        /// Why the check could not run
        reason: String,
    },

    /// Missing or malformed caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Local I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else, with the underlying message
    #[error("Unexpected error: {0}")]
    Unknown(String),
}

impl RsyncError {
    /// Whether the caller can reasonably retry with the same or corrected input
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Connect(_) | Self::CheckFailed { .. })
    }
}

impl From<TransportError> for RsyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Authentication(msg) => Self::Auth(msg),
            TransportError::Connection(msg) => Self::Connect(msg),
            TransportError::HostKey { .. } | TransportError::Timeout(_) => Self::Connect(err.to_string()),
            TransportError::KeyInstall { step, code, message } => Self::KeyInstall { step, code, message },
            TransportError::Io(e) => Self::Io(e),
            TransportError::Configuration(msg) => Self::InvalidInput(msg),
            TransportError::Key(_) | TransportError::Ssh(_) => Self::Unknown(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transport_error_mapping() {
        assert!(matches!(
            RsyncError::from(TransportError::Authentication("denied".into())),
            RsyncError::Auth(_)
        ));
        assert!(matches!(
            RsyncError::from(TransportError::Timeout(Duration::from_secs(5))),
            RsyncError::Connect(_)
        ));
        assert!(matches!(
            RsyncError::from(TransportError::HostKey { host: "h".into(), reason: "mismatch".into() }),
            RsyncError::Connect(_)
        ));
        assert!(matches!(
            RsyncError::from(TransportError::Ssh("weird".into())),
            RsyncError::Unknown(_)
        ));
    }

    #[test]
    fn test_key_install_keeps_step() {
        let err = RsyncError::from(TransportError::KeyInstall {
            step: InstallStep::RestrictPermissions,
            code: 1,
            message: "Operation not permitted".into(),
        });
        assert!(matches!(err, RsyncError::KeyInstall { step: InstallStep::RestrictPermissions, code: 1, .. }));
        assert!(err.to_string().contains("restrict authorized_keys"));
    }

    #[test]
    fn test_messages_name_the_category() {
        assert!(RsyncError::Auth("x".into()).to_string().contains("password"));
        assert!(RsyncError::Connect("x".into()).to_string().contains("SSH service"));
        assert!(RsyncError::NotFound { path: "/srv".into() }.to_string().contains("does not exist"));
        assert!(RsyncError::Unknown("boom".into()).to_string().ends_with("boom"));
    }

    #[test]
    fn test_retryable() {
        assert!(RsyncError::Auth("x".into()).is_retryable());
        assert!(RsyncError::Connect("x".into()).is_retryable());
        assert!(!RsyncError::NotFound { path: "/".into() }.is_retryable());
        assert!(!RsyncError::Unknown("x".into()).is_retryable());
    }
}
