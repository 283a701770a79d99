//! Transport abstraction and implementations

use async_trait::async_trait;
use crate::{HostKeyPolicy, TransportError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Remote command execution over some SSH channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run a shell command on the remote host and collect its output.
    ///
    /// A non-zero exit status is not an error here; callers decide what a
    /// given status means.
    async fn execute(&self, command: &str) -> Result<CommandOutput, TransportError>;

    /// Get connection information
    fn connection_info(&self) -> ConnectionInfo;

    /// Test connectivity to the remote host
    async fn test_connection(&self) -> Result<(), TransportError> {
        let output = self.execute("echo connection_test").await?;
        if !output.success() || !output.stdout.contains("connection_test") {
            return Err(TransportError::Connection(format!(
                "connection test failed with exit code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Result of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, `-1` when the process was killed by a signal
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Connection information
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Username
    pub username: String,
    /// Connection type
    pub transport_type: TransportType,
}

/// Transport type enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportType {
    /// SSH with subprocess
    SshSubprocess,
    /// SSH with libssh2
    SshLibssh2,
    /// Local process (for testing)
    Local,
}

/// SSH configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port (default: 22)
    pub port: u16,
    /// Username
    pub username: String,
    /// Identity file passed with `-i`
    pub key_path: Option<PathBuf>,
    /// known_hosts file the host key must match
    pub known_hosts_path: Option<PathBuf>,
    /// Extra `-o` options
    pub options: BTreeMap<String, String>,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Command timeout
    pub command_timeout: Duration,
    /// How the remote host key is verified
    pub host_key_policy: HostKeyPolicy,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            username: "root".to_string(),
            key_path: None,
            known_hosts_path: None,
            options: BTreeMap::new(),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

impl SshConfig {
    /// `user@host` destination string
    pub fn target(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// SSH transport that shells out to the `ssh` client with key authentication
#[derive(Debug, Clone)]
pub struct StdioTransport {
    /// SSH configuration
    config: SshConfig,
    /// Client program, `ssh` unless overridden
    program: PathBuf,
}

impl StdioTransport {
    /// Create a new stdio transport
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            program: PathBuf::from("ssh"),
        }
    }

    /// Use a different `ssh` client binary
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// The configuration this transport connects with
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Build SSH option arguments, without the destination
    fn build_option_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(), "BatchMode=yes".to_string(),
            "-o".to_string(), format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
            "-p".to_string(), self.config.port.to_string(),
        ];

        if let Some(key_path) = &self.config.key_path {
            args.push("-i".to_string());
            args.push(key_path.to_string_lossy().to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }

        match &self.config.known_hosts_path {
            Some(path) => {
                args.push("-o".to_string());
                args.push("StrictHostKeyChecking=yes".to_string());
                args.push("-o".to_string());
                args.push(format!("UserKnownHostsFile={}", path.to_string_lossy()));
            }
            None => {
                args.push("-o".to_string());
                args.push("StrictHostKeyChecking=accept-new".to_string());
            }
        }

        for (key, value) in &self.config.options {
            args.push("-o".to_string());
            args.push(format!("{}={}", key, value));
        }

        args
    }

    /// Build SSH command arguments ending with the destination
    fn build_ssh_args(&self) -> Vec<String> {
        let mut args = self.build_option_args();
        args.push(self.config.target());
        args
    }

    /// The remote shell as a single command line, suitable for `rsync -e`.
    ///
    /// Every word is shell-quoted; rsync splits the string the same way a
    /// shell would.
    pub fn remote_shell_command(&self) -> String {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.build_option_args())
            .map(|word| shell_escape::unix::escape(word.into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn execute(&self, command: &str) -> Result<CommandOutput, TransportError> {
        let mut ssh_args = self.build_ssh_args();
        ssh_args.push(command.to_string());

        debug!("Executing SSH command: {} {}", self.program.display(), ssh_args.join(" "));

        let child = Command::new(&self.program)
            .args(&ssh_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Connection(format!("Failed to execute SSH: {}", e)))?;

        let output = tokio::time::timeout(self.config.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| TransportError::Timeout(self.config.command_timeout))??;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            transport_type: TransportType::SshSubprocess,
        }
    }
}
