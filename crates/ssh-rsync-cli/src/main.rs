//! ssh-rsync command-line front-end
//!
//! Logs in once with a password, installs a fresh key, checks the remote
//! destination and copies every source with its own rsync process.

mod output;

use anyhow::{bail, Context, Result};
use clap::Parser;
use output::Printer;
use secrecy::{ExposeSecret, SecretString};
use ssh_rsync::{Orchestrator, RsyncError, SessionBuilder, SourceList, TransferConfig};
use ssh_rsync_ssh::HostKeyPolicy;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Some transfers exited non-zero or were cancelled
const EXIT_TRANSFER_FAILED: u8 = 3;

/// Environment variable holding the login password
const PASSWORD_ENV: &str = "SSH_RSYNC_PASSWORD";

#[derive(Parser, Debug)]
#[command(name = "ssh-rsync")]
#[command(about = "Copy files to a remote host with rsync over a freshly trusted SSH key")]
#[command(version)]
#[command(after_help = "The login password is taken from SSH_RSYNC_PASSWORD, or prompted for on standard input.")]
struct Cli {
    /// Remote host name or address
    #[arg(long)]
    host: String,

    /// Remote user
    #[arg(short, long)]
    user: String,

    /// SSH port
    #[arg(short, long, default_value_t = 22)]
    port: u16,

    /// Destination directory on the remote host
    #[arg(short, long)]
    dest: String,

    /// Local files or directories; each argument may hold a comma-separated list
    #[arg(required = true)]
    sources: Vec<String>,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Verify the host key against this known_hosts file
    #[arg(long, conflicts_with = "fingerprint")]
    known_hosts: Option<PathBuf>,

    /// Expected SHA256 host key fingerprint
    #[arg(long)]
    fingerprint: Option<String>,

    /// rsync binary; the newest installed one is used by default
    #[arg(long)]
    rsync: Option<PathBuf>,

    /// Maximum number of transfers running at once
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Extra argument passed to rsync (repeatable)
    #[arg(long = "rsync-arg", allow_hyphen_values = true)]
    rsync_args: Vec<String>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn host_key_policy(&self) -> HostKeyPolicy {
        match (&self.known_hosts, &self.fingerprint) {
            (Some(path), _) => HostKeyPolicy::KnownHosts(path.clone()),
            (None, Some(fingerprint)) => HostKeyPolicy::Pinned(fingerprint.clone()),
            (None, None) => HostKeyPolicy::TrustOnFirstUse,
        }
    }

    fn source_list(&self) -> SourceList {
        let mut sources = SourceList::new();
        for arg in &self.sources {
            sources.extend(SourceList::parse(arg).iter());
        }
        sources
    }

    fn transfer_config(&self) -> TransferConfig {
        let mut config = TransferConfig::default();
        if let Some(rsync) = &self.rsync {
            config = config.with_rsync_path(rsync);
        }
        if let Some(jobs) = self.jobs {
            config = config.with_max_concurrent_jobs(jobs);
        }
        for arg in &self.rsync_args {
            config = config.with_extra_arg(arg);
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<RsyncError>() {
                Some(err) if err.is_retryable() => error!("{} (check the input and try again)", err),
                Some(err) => error!("{}", err),
                None => error!("{:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let sources = cli.source_list();
    if sources.is_empty() {
        bail!("no source paths given");
    }

    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) if !password.is_empty() => SecretString::new(password),
        _ => read_password().await?,
    };

    let session = SessionBuilder::new(&cli.host, &cli.user)
        .with_port(cli.port)
        .with_timeout(Duration::from_secs(cli.timeout))
        .with_host_key_policy(cli.host_key_policy())
        .bootstrap(&password)
        .await?;
    drop(password);

    info!(
        "Connected to {} (host key {})",
        session.endpoint().target(),
        session.host_key_fingerprint()
    );

    let session = Arc::new(session);
    let orchestrator = Orchestrator::for_session(session.clone(), cli.transfer_config());

    let mut printer = Printer::new(std::io::stdout().lock(), cli.json);
    let mut batch = orchestrator.start_sources(&cli.dest, &sources).await?;
    printer.banner(batch.total(), &session.endpoint().remote_path(cli.dest.trim()))?;

    let mut all_succeeded = false;
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = batch.next_event() => {
                let Some(event) = event else { break };
                if let ssh_rsync::BatchEvent::BatchComplete(summary) = &event {
                    all_succeeded = summary.all_succeeded();
                }
                printer.event(&event)?;
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                warn!("Interrupted, stopping transfers");
                interrupted = true;
                batch.cancel();
            }
        }
    }

    drop(printer);
    drop(orchestrator);
    match Arc::try_unwrap(session) {
        Ok(session) => session.close()?,
        Err(_) => warn!("Session still referenced, key file will be removed when it is released"),
    }

    if all_succeeded {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_TRANSFER_FAILED))
    }
}

async fn read_password() -> Result<SecretString> {
    if std::io::stdin().is_terminal() {
        let password = tokio::task::spawn_blocking(|| {
            dialoguer::Password::new().with_prompt("Password").interact()
        })
        .await
        .context("Password prompt task failed")?
        .context("Failed to read password")?;
        return password_from_line(password);
    }

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read password from stdin")?;
    password_from_line(line)
}

/// Strip the line ending from piped input and reject an empty password
fn password_from_line(line: String) -> Result<SecretString> {
    let password = SecretString::new(line.trim_end_matches(['\r', '\n']).to_string());
    drop(line);
    if password.expose_secret().is_empty() {
        bail!("a password is required");
    }
    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ssh-rsync").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_sources_accept_lists_and_repeats() {
        let cli = parse(&["--host", "h", "-u", "alice", "-d", "/srv", "/tmp/a.txt, /tmp/b", "/tmp/c"]);
        assert_eq!(cli.source_list().entries(), &["/tmp/a.txt", "/tmp/b", "/tmp/c"]);
    }

    #[test]
    fn test_host_key_policy_from_flags() {
        let cli = parse(&["--host", "h", "-u", "a", "-d", "/srv", "x", "--fingerprint", "SHA256:abc"]);
        assert_eq!(cli.host_key_policy(), HostKeyPolicy::Pinned("SHA256:abc".to_string()));

        let cli = parse(&["--host", "h", "-u", "a", "-d", "/srv", "x"]);
        assert_eq!(cli.host_key_policy(), HostKeyPolicy::TrustOnFirstUse);
    }

    #[test]
    fn test_known_hosts_conflicts_with_fingerprint() {
        let result = Cli::try_parse_from([
            "ssh-rsync", "--host", "h", "-u", "a", "-d", "/srv", "x",
            "--known-hosts", "/tmp/kh", "--fingerprint", "SHA256:abc",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_transfer_config_from_flags() {
        let cli = parse(&[
            "--host", "h", "-u", "a", "-d", "/srv", "x",
            "--rsync", "/opt/homebrew/bin/rsync", "-j", "2", "--rsync-arg", "--partial",
        ]);
        let config = cli.transfer_config();
        assert_eq!(config.rsync_path, Some(PathBuf::from("/opt/homebrew/bin/rsync")));
        assert_eq!(config.max_concurrent_jobs, Some(2));
        assert_eq!(config.extra_args, vec!["--partial"]);
    }

    #[test]
    fn test_password_not_accepted_as_flag() {
        let result = Cli::try_parse_from(["ssh-rsync", "--host", "h", "-u", "a", "-d", "/srv", "x", "--password", "pw"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_password_from_piped_line() {
        let password = password_from_line("s3cret pass\r\n".to_string()).unwrap();
        assert_eq!(password.expose_secret(), "s3cret pass");

        assert!(password_from_line("\n".to_string()).is_err());
    }

    #[test]
    fn test_sources_required() {
        assert!(Cli::try_parse_from(["ssh-rsync", "--host", "h", "-u", "a", "-d", "/srv"]).is_err());
    }
}
