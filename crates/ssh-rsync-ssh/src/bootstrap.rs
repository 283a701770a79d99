//! Authorized-keys installation on the remote host

use crate::{Transport, TransportError};
use std::fmt;
use tracing::{debug, info};

/// Remote file listing the public keys allowed to log in
pub const AUTHORIZED_KEYS_PATH: &str = "~/.ssh/authorized_keys";

/// One step of the key installation, run in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    /// Create `~/.ssh` with mode 700
    CreateSshDir,
    /// Append the public key to authorized_keys
    AppendKey,
    /// Restrict authorized_keys to mode 600
    RestrictPermissions,
}

impl InstallStep {
    /// Steps in execution order
    pub const ALL: [InstallStep; 3] = [
        InstallStep::CreateSshDir,
        InstallStep::AppendKey,
        InstallStep::RestrictPermissions,
    ];

    /// Step following this one, if any
    pub fn next(self) -> Option<Self> {
        match self {
            InstallStep::CreateSshDir => Some(InstallStep::AppendKey),
            InstallStep::AppendKey => Some(InstallStep::RestrictPermissions),
            InstallStep::RestrictPermissions => None,
        }
    }

    /// Remote shell command for this step
    pub fn command(self, public_key_line: &str) -> String {
        match self {
            InstallStep::CreateSshDir => "mkdir -p ~/.ssh && chmod 700 ~/.ssh".to_string(),
            // A file whose last line lacks a newline would swallow the new key
            InstallStep::AppendKey => format!(
                "{{ [ ! -s {file} ] || [ -z \"$(tail -c1 {file})\" ] || echo >> {file}; }} && echo {key} >> {file}",
                file = AUTHORIZED_KEYS_PATH,
                key = shell_escape::unix::escape(public_key_line.trim().into()),
            ),
            InstallStep::RestrictPermissions => format!("chmod 600 {}", AUTHORIZED_KEYS_PATH),
        }
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstallStep::CreateSshDir => "create ~/.ssh",
            InstallStep::AppendKey => "append public key",
            InstallStep::RestrictPermissions => "restrict authorized_keys",
        };
        f.write_str(name)
    }
}

/// Installs a public key into the remote authorized-keys store.
///
/// Each step must exit 0 before the next one runs. On failure the error
/// names the step, and [`Bootstrap::completed_steps`] tells how far the
/// installation got.
#[derive(Debug, Default)]
pub struct Bootstrap {
    completed: Vec<InstallStep>,
}

impl Bootstrap {
    /// Create a new bootstrap instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every install step over `transport`
    pub async fn install_key<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        public_key_line: &str,
    ) -> Result<(), TransportError> {
        if public_key_line.trim().is_empty() || public_key_line.contains('\n') {
            return Err(TransportError::Key("public key must be a single non-empty line".to_string()));
        }

        let info = transport.connection_info();
        info!("Installing public key for {}@{}", info.username, info.host);

        self.completed.clear();
        let mut step = Some(InstallStep::CreateSshDir);
        while let Some(current) = step {
            debug!("Key install step: {}", current);

            let output = transport
                .execute(&current.command(public_key_line))
                .await
                .map_err(|e| TransportError::KeyInstall {
                    step: current,
                    code: -1,
                    message: e.to_string(),
                })?;

            if !output.success() {
                return Err(TransportError::KeyInstall {
                    step: current,
                    code: output.exit_code,
                    message: output.stderr.trim().to_string(),
                });
            }

            self.completed.push(current);
            step = current.next();
        }

        info!("Public key installed on {}", info.host);
        Ok(())
    }

    /// Steps that finished successfully during the last install
    pub fn completed_steps(&self) -> &[InstallStep] {
        &self.completed
    }

    /// Whether the last install ran to completion
    pub fn is_complete(&self) -> bool {
        self.completed.len() == InstallStep::ALL.len()
    }
}
