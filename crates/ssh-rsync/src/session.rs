//! Trust bootstrap and session artifacts

use crate::{Result, RsyncError};
use secrecy::{ExposeSecret, SecretString};
use ssh_rsync_ssh::{Bootstrap, Connection, HostKeyPolicy, KeyPair, SshConfig, StdioTransport};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Key pair generated for one session
pub use ssh_rsync_ssh::KeyPair as KeyMaterial;

/// File name of the private key inside the session directory
pub const KEY_FILE_NAME: &str = "id_rsa";

/// File name of the pinned host key inside the session directory
pub const KNOWN_HOSTS_FILE_NAME: &str = "known_hosts";

/// The remote account a session talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    /// Remote hostname or IP
    pub host: String,
    /// Remote user
    pub user: String,
    /// SSH port
    pub port: u16,
}

impl RemoteEndpoint {
    /// Create an endpoint on the default SSH port
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: 22,
        }
    }

    /// `user@host`
    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// `user@host:path` operand for rsync; IPv6 literals are bracketed
    pub fn remote_path(&self, path: &str) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{}@[{}]:{}", self.user, self.host, path)
        } else {
            format!("{}@{}:{}", self.user, self.host, path)
        }
    }
}

/// Files a session keeps on disk: the private key and the pinned host key.
///
/// Both live in a fresh directory under the system temp dir, created with
/// owner-only permissions and removed when the artifacts are dropped.
#[derive(Debug)]
pub struct SessionArtifacts {
    dir: TempDir,
    key_path: PathBuf,
    known_hosts_path: PathBuf,
}

impl SessionArtifacts {
    /// Write the private key (mode 600) and the known_hosts line
    pub fn create(private_key: &SecretString, known_hosts_line: &str) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("ssh-rsync-").tempdir()?;
        restrict_to_owner(dir.path())?;
        let key_path = dir.path().join(KEY_FILE_NAME);
        let known_hosts_path = dir.path().join(KNOWN_HOSTS_FILE_NAME);

        let mut key_file = owner_only_file(&key_path)?;
        key_file.write_all(private_key.expose_secret().as_bytes())?;
        key_file.sync_all()?;

        fs::write(&known_hosts_path, format!("{}\n", known_hosts_line.trim()))?;

        debug!("Session artifacts written to {}", dir.path().display());
        Ok(Self { dir, key_path, known_hosts_path })
    }

    /// Directory holding the artifacts
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Private key file
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// known_hosts file pinning the bootstrap host key
    pub fn known_hosts_path(&self) -> &Path {
        &self.known_hosts_path
    }

    /// Remove the artifacts now and report any error
    pub fn close(self) -> Result<()> {
        self.dir.close()?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_to_owner(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_to_owner(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn owner_only_file(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new().write(true).create_new(true).mode(0o600).open(path)
}

#[cfg(not(unix))]
fn owner_only_file(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

/// A session whose key is trusted by the remote account
#[derive(Debug)]
pub struct TrustedSession {
    id: Uuid,
    endpoint: RemoteEndpoint,
    key: KeyMaterial,
    host_key_fingerprint: String,
    artifacts: SessionArtifacts,
    connect_timeout: Duration,
    ssh_options: BTreeMap<String, String>,
}

impl TrustedSession {
    /// Unique session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remote account
    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    /// Generated key pair
    pub fn key_material(&self) -> &KeyMaterial {
        &self.key
    }

    /// Fingerprint of the host key accepted during bootstrap
    pub fn host_key_fingerprint(&self) -> &str {
        &self.host_key_fingerprint
    }

    /// On-disk files of this session
    pub fn artifacts(&self) -> &SessionArtifacts {
        &self.artifacts
    }

    /// SSH configuration for key-based connections, pinned to the
    /// bootstrap host key
    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            username: self.endpoint.user.clone(),
            key_path: Some(self.artifacts.key_path().to_path_buf()),
            known_hosts_path: Some(self.artifacts.known_hosts_path().to_path_buf()),
            connect_timeout: self.connect_timeout,
            options: self.ssh_options.clone(),
            ..Default::default()
        }
    }

    /// Subprocess transport that logs in with the session key
    pub fn transport(&self) -> StdioTransport {
        StdioTransport::new(self.ssh_config())
    }

    /// End the session, deleting the key file
    pub fn close(self) -> Result<()> {
        info!("Closing session {}", self.id);
        self.artifacts.close()
    }
}

/// Builder for a trust bootstrap
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    ssh_config: SshConfig,
    key_comment: Option<String>,
}

impl SessionBuilder {
    /// Create a new session builder
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        let ssh_config = SshConfig {
            host: host.into(),
            username: user.into(),
            ..Default::default()
        };
        Self { ssh_config, key_comment: None }
    }

    /// Create a builder from a `[user@]host[:port]` string
    pub fn from_target(target: &str) -> Self {
        let (username, host, port) = Self::parse_target(target);
        Self::new(host, username).with_port(port)
    }

    /// Parse target string into components
    fn parse_target(target: &str) -> (String, String, u16) {
        let mut username = "root".to_string();
        let mut host = target.to_string();
        let mut port = 22;

        if let Some(at_pos) = target.rfind('@') {
            username = target[..at_pos].to_string();
            host = target[at_pos + 1..].to_string();
        }

        // A bare IPv6 literal has several colons and no port
        if host.matches(':').count() == 1 {
            if let Some(colon_pos) = host.rfind(':') {
                if let Ok(parsed_port) = host[colon_pos + 1..].parse::<u16>() {
                    port = parsed_port;
                    host = host[..colon_pos].to_string();
                }
            }
        }

        (username, host, port)
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.ssh_config.port = port;
        self
    }

    /// Set connection timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.ssh_config.connect_timeout = timeout;
        self
    }

    /// Set how the host key is verified
    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.ssh_config.host_key_policy = policy;
        self
    }

    /// Set an extra `-o` option for every key-based `ssh` the session runs,
    /// rsync's remote shell included
    pub fn with_ssh_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ssh_config.options.insert(key.into(), value.into());
        self
    }

    /// Set the comment stored with the generated public key
    pub fn with_key_comment(mut self, comment: impl Into<String>) -> Self {
        self.key_comment = Some(comment.into());
        self
    }

    /// Build the connection configuration
    pub fn build_config(&self) -> SshConfig {
        self.ssh_config.clone()
    }

    /// Log in with the password, install a fresh public key and return the
    /// trusted session.
    ///
    /// Nothing is retried; an error leaves no local artifacts behind.
    pub async fn bootstrap(self, password: &SecretString) -> Result<TrustedSession> {
        let config = self.ssh_config;
        if config.host.trim().is_empty() || config.username.trim().is_empty() {
            return Err(RsyncError::InvalidInput("host and user are required".to_string()));
        }
        if password.expose_secret().is_empty() {
            return Err(RsyncError::InvalidInput("password is required".to_string()));
        }

        let id = Uuid::new_v4();
        info!("Bootstrapping session {} for {}@{}:{}", id, config.username, config.host, config.port);

        let connection = Connection::connect_password(&config, password).await?;

        let comment = self
            .key_comment
            .unwrap_or_else(|| format!("ssh-rsync-{}", id.simple()));
        let key = tokio::task::spawn_blocking(move || KeyPair::generate(&comment))
            .await
            .map_err(|e| RsyncError::Unknown(format!("key generation task failed: {}", e)))??;

        let mut installer = Bootstrap::new();
        if let Err(e) = installer.install_key(&connection, key.public_key_line()).await {
            warn!("Key installation stopped after {:?}", installer.completed_steps());
            connection.close();
            return Err(e.into());
        }

        let known_hosts_line = connection.host_key().known_hosts_line(&config.host, config.port)?;
        let host_key_fingerprint = connection.host_key().fingerprint();
        connection.close();

        let artifacts = SessionArtifacts::create(key.private_key(), &known_hosts_line)?;

        info!("Session {} trusted by {}@{}", id, config.username, config.host);
        Ok(TrustedSession {
            id,
            endpoint: RemoteEndpoint {
                host: config.host,
                user: config.username,
                port: config.port,
            },
            key,
            host_key_fingerprint,
            artifacts,
            connect_timeout: config.connect_timeout,
            ssh_options: config.options,
        })
    }
}

/// Bootstrap trust for `user@host` with a password and connect timeout
pub async fn bootstrap(
    host: &str,
    user: &str,
    password: &SecretString,
    timeout: Duration,
) -> Result<TrustedSession> {
    SessionBuilder::new(host, user)
        .with_timeout(timeout)
        .bootstrap(password)
        .await
}
