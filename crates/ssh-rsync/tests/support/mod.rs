//! Test doubles for the `ssh` and `rsync` programs
//!
//! Each fake is a small shell script written into a temporary directory. The
//! scripts append their arguments to a log file so tests can check what was
//! run and in which order.

#![allow(dead_code)]

use anyhow::{Context, Result};
use ssh_rsync::{Orchestrator, TransferConfig};
use ssh_rsync_ssh::SshConfig;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A directory holding fake `ssh` and `rsync` programs
pub struct FakeTools {
    dir: TempDir,
}

impl FakeTools {
    /// Create an empty tool directory
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("ssh-rsync-fakes-")
            .tempdir()
            .context("Failed to create fake tool directory")?;
        Ok(Self { dir })
    }

    /// Directory path
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Log file the fake `ssh` appends to
    pub fn ssh_log(&self) -> PathBuf {
        self.dir.path().join("ssh.log")
    }

    /// Log file the fake `rsync` appends to
    pub fn rsync_log(&self) -> PathBuf {
        self.dir.path().join("rsync.log")
    }

    /// Install a fake `ssh` that logs its last argument and exits with `code`
    pub fn ssh(&self, code: i32, stderr: &str) -> Result<PathBuf> {
        let script = format!(
            "#!/bin/sh\nfor last; do :; done\nprintf '%s\\n' \"$last\" >> '{log}'\nprintf '%s' '{stderr}' >&2\nexit {code}\n",
            log = self.ssh_log().display(),
            stderr = stderr,
            code = code,
        );
        self.install("ssh", &script)
    }

    /// Install a fake `ssh` that never answers
    pub fn hanging_ssh(&self) -> Result<PathBuf> {
        self.install("ssh", "#!/bin/sh\nexec sleep 30\n")
    }

    /// Install a fake `rsync` that prints progress for its source and exits
    /// with `code`
    pub fn rsync(&self, code: i32) -> Result<PathBuf> {
        let script = format!(
            r#"#!/bin/sh
n=$#
i=0
for arg; do
  i=$((i+1))
  if [ $i -eq $((n-1)) ]; then src="$arg"; fi
done
printf '%s\n' "$*" >> '{log}'
echo "sending incremental file list"
printf '%s\n' "$src"
printf '      1,024  50%%\r      2,048 100%%\r\n'
if [ {code} -ne 0 ]; then echo "rsync error: some files could not be transferred (code {code})" >&2; fi
exit {code}
"#,
            log = self.rsync_log().display(),
            code = code,
        );
        self.install("rsync", &script)
    }

    /// Install a fake `rsync` that sleeps until killed
    pub fn slow_rsync(&self) -> Result<PathBuf> {
        let script = format!(
            "#!/bin/sh\nprintf '%s\\n' \"$*\" >> '{log}'\necho started\nexec sleep 30\n",
            log = self.rsync_log().display(),
        );
        self.install("rsync", &script)
    }

    /// Lines of a log file, empty when the program never ran
    pub fn log_lines(&self, log: &Path) -> Vec<String> {
        fs::read_to_string(log)
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn install(&self, name: &str, script: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        fs::write(&path, script).with_context(|| format!("Failed to write fake {}", name))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
        Ok(path)
    }
}

/// SSH configuration pointing at a host that is never contacted
pub fn ssh_config() -> SshConfig {
    SshConfig {
        host: "backup.example.com".to_string(),
        username: "alice".to_string(),
        ..Default::default()
    }
}

/// Orchestrator wired to the fake programs
pub fn orchestrator(ssh: &Path, rsync: &Path, config: TransferConfig) -> Orchestrator {
    Orchestrator::new(
        ssh_config(),
        config.with_ssh_program(ssh).with_rsync_path(rsync),
    )
}
