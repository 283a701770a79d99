//! # ssh-rsync SSH transport
//!
//! SSH layer for ssh-rsync: password sessions, subprocess `ssh` commands,
//! host-key policy, key generation and authorized-keys installation.

#![warn(missing_docs)]

/// Transport abstraction and the `ssh` subprocess implementation
pub mod transport;

/// Password-authenticated libssh2 connection
pub mod connection;

/// Host key verification policy
pub mod host_key;

/// Session key pair generation
pub mod keys;

/// Authorized-keys installation
pub mod bootstrap;

/// SSH-specific error types
pub mod error;

pub use transport::{Transport, StdioTransport, SshConfig, ConnectionInfo, TransportType, CommandOutput};
pub use connection::Connection;
pub use host_key::{HostKeyPolicy, HostKey};
pub use keys::KeyPair;
pub use bootstrap::{Bootstrap, InstallStep};
pub use error::TransportError;
