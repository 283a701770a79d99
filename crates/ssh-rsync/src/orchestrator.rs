//! Batch validation, fan-out and completion tracking

use crate::job::{JobOutcome, JobStatus, TransferJob, TransferSpec, DEFAULT_LINE_CAPACITY};
use crate::locate::find_best_rsync;
use crate::session::{RemoteEndpoint, TrustedSession};
use crate::sources::SourceList;
use crate::{Result, RsyncError};
use serde::Serialize;
use ssh_rsync_ssh::{SshConfig, StdioTransport, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Settings for transfer batches
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// rsync binary; discovered per batch when unset
    pub rsync_path: Option<PathBuf>,
    /// `ssh` client used for the destination check and as rsync's remote shell
    pub ssh_program: PathBuf,
    /// Value of rsync's `--info=` flag, omitted when unset
    pub progress_format: Option<String>,
    /// Extra rsync arguments, placed before the source
    pub extra_args: Vec<String>,
    /// Upper bound on jobs running at once; unbounded when unset
    pub max_concurrent_jobs: Option<usize>,
    /// Buffered lines per job
    pub line_capacity: usize,
    /// Time allowed for the destination check
    pub check_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            rsync_path: None,
            ssh_program: PathBuf::from("ssh"),
            progress_format: Some("progress2".to_string()),
            extra_args: Vec::new(),
            max_concurrent_jobs: None,
            line_capacity: DEFAULT_LINE_CAPACITY,
            check_timeout: Duration::from_secs(10),
        }
    }
}

impl TransferConfig {
    /// Use a specific rsync binary
    pub fn with_rsync_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.rsync_path = Some(path.into());
        self
    }

    /// Use a specific ssh client
    pub fn with_ssh_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.ssh_program = program.into();
        self
    }

    /// Set or clear the `--info=` progress format
    pub fn with_progress_format(mut self, format: Option<String>) -> Self {
        self.progress_format = format;
        self
    }

    /// Append an extra rsync argument
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Limit how many jobs run at once
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = Some(max.max(1));
        self
    }

    /// Set the per-job line buffer
    pub fn with_line_capacity(mut self, capacity: usize) -> Self {
        self.line_capacity = capacity.max(1);
        self
    }

    /// Set the destination check timeout
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }
}

/// Completed and total job counts for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionProgress {
    /// Jobs that have finished, successfully or not
    pub completed: usize,
    /// Jobs in the batch
    pub total: usize,
}

impl SessionProgress {
    /// Progress of a batch that has not finished any job yet
    pub fn new(total: usize) -> Self {
        Self { completed: 0, total }
    }

    /// Whether every job has finished
    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }

    /// Jobs still running or waiting
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed)
    }
}

/// Final report for a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Batch ID
    pub batch_id: Uuid,
    /// Jobs in the batch
    pub total: usize,
    /// Jobs that finished
    pub completed: usize,
    /// Jobs whose rsync exited 0
    pub succeeded: usize,
    /// Jobs that ended any other way
    pub failed: usize,
    /// Per-job outcomes ordered by index
    pub outcomes: Vec<JobOutcome>,
}

impl BatchSummary {
    /// Whether every transfer exited 0
    pub fn all_succeeded(&self) -> bool {
        self.completed == self.total && self.failed == 0
    }
}

/// Event delivered to the consumer of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    /// A line of a job's output; the empty line marks the job's end
    Line {
        /// Job index
        index: usize,
        /// Decoded text
        line: String,
    },
    /// A job finished
    JobFinished(JobOutcome),
    /// Every job of the batch finished; sent once, last
    BatchComplete(BatchSummary),
}

#[derive(Debug)]
enum JobMessage {
    Line { index: usize, line: String },
    Finished(JobOutcome),
}

/// Consumer side of a running batch
#[derive(Debug)]
pub struct BatchHandle {
    id: Uuid,
    total: usize,
    events: mpsc::Receiver<BatchEvent>,
    progress: watch::Receiver<SessionProgress>,
    cancel: CancellationToken,
    aggregator: JoinHandle<BatchSummary>,
}

impl BatchHandle {
    /// Batch ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of jobs in the batch
    pub fn total(&self) -> usize {
        self.total
    }

    /// Next event; `None` after `BatchComplete` has been delivered
    pub async fn next_event(&mut self) -> Option<BatchEvent> {
        self.events.recv().await
    }

    /// Latest progress snapshot
    pub fn progress(&self) -> SessionProgress {
        *self.progress.borrow()
    }

    /// Stop every job of the batch; each still reports a finished event
    pub fn cancel(&self) {
        info!("Cancelling batch {}", self.id);
        self.cancel.cancel();
    }

    /// Token that cancels the batch
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Discard remaining events and wait for the summary
    pub async fn wait(mut self) -> Result<BatchSummary> {
        while self.events.recv().await.is_some() {}
        self.aggregator
            .await
            .map_err(|e| RsyncError::Unknown(format!("batch aggregator failed: {}", e)))
    }
}

/// Runs transfer batches against one remote account
pub struct Orchestrator {
    endpoint: RemoteEndpoint,
    config: TransferConfig,
    checker: Arc<dyn Transport>,
    remote_shell: String,
    session: Option<Arc<TrustedSession>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .field("remote_shell", &self.remote_shell)
            .finish()
    }
}

impl Orchestrator {
    /// Create an orchestrator that connects with `ssh_config`
    pub fn new(ssh_config: SshConfig, config: TransferConfig) -> Self {
        let endpoint = RemoteEndpoint {
            host: ssh_config.host.clone(),
            user: ssh_config.username.clone(),
            port: ssh_config.port,
        };
        let transport = StdioTransport::new(SshConfig {
            command_timeout: config.check_timeout,
            ..ssh_config
        })
        .with_program(&config.ssh_program);
        let remote_shell = transport.remote_shell_command();

        Self {
            endpoint,
            config,
            checker: Arc::new(transport),
            remote_shell,
            session: None,
        }
    }

    /// Create an orchestrator using a bootstrapped session's key.
    ///
    /// The session, and with it the key file, is kept alive until every
    /// batch started here has finished.
    pub fn for_session(session: Arc<TrustedSession>, config: TransferConfig) -> Self {
        let mut orchestrator = Self::new(session.ssh_config(), config);
        orchestrator.session = Some(session);
        orchestrator
    }

    /// Run the destination check through a different transport
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.checker = transport;
        self
    }

    /// Remote account
    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    /// Batch settings
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// The `-e` value handed to rsync
    pub fn remote_shell(&self) -> &str {
        &self.remote_shell
    }

    /// Check that `destination` is a directory on the remote host
    pub async fn validate_destination(&self, destination: &str) -> Result<()> {
        let command = format!("test -d {}", shell_escape::unix::escape(destination.into()));
        debug!("Checking destination {} on {}", destination, self.endpoint.target());

        let result = tokio::time::timeout(self.config.check_timeout, self.checker.execute(&command)).await;
        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RsyncError::CheckFailed {
                    path: destination.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(RsyncError::CheckFailed {
                    path: destination.to_string(),
                    reason: format!("no answer within {:?}", self.config.check_timeout),
                })
            }
        };

        match output.exit_code {
            0 => Ok(()),
            // ssh reports its own failures as 255
            code if code == 255 || code < 0 => {
                let stderr = output.stderr.trim();
                let reason = if stderr.is_empty() {
                    format!("ssh exited with status {}", code)
                } else {
                    stderr.to_string()
                };
                Err(RsyncError::CheckFailed {
                    path: destination.to_string(),
                    reason,
                })
            }
            _ => Err(RsyncError::NotFound {
                path: destination.to_string(),
            }),
        }
    }

    /// Start one transfer per entry of a comma-joined source list
    pub async fn start_batch(&self, destination: &str, sources: &str) -> Result<BatchHandle> {
        self.start_sources(destination, &SourceList::parse(sources)).await
    }

    /// Validate the destination, then start one transfer per source.
    ///
    /// Returns once every job has been launched; the handle delivers their
    /// output and a single `BatchComplete` after the last one finishes.
    pub async fn start_sources(&self, destination: &str, sources: &SourceList) -> Result<BatchHandle> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(RsyncError::InvalidInput("destination path is required".to_string()));
        }
        if sources.is_empty() {
            return Err(RsyncError::InvalidInput("at least one source path is required".to_string()));
        }

        self.validate_destination(destination).await?;

        let rsync = match &self.config.rsync_path {
            Some(path) => path.clone(),
            None => find_best_rsync().await,
        };

        let id = Uuid::new_v4();
        let total = sources.len();
        info!(
            "Batch {}: transferring {} item(s) to {}:{} with {}",
            id,
            total,
            self.endpoint.target(),
            destination,
            rsync.display()
        );

        let cancel = CancellationToken::new();
        let limiter = self
            .config
            .max_concurrent_jobs
            .map(|max| Arc::new(Semaphore::new(max.max(1))));
        let (job_tx, job_rx) = mpsc::channel(self.config.line_capacity);
        let (event_tx, event_rx) = mpsc::channel(self.config.line_capacity);
        let (progress_tx, progress_rx) = watch::channel(SessionProgress::new(total));

        for (i, source) in sources.iter().enumerate() {
            let spec = TransferSpec {
                source_path: source.clone(),
                destination_path: destination.to_string(),
                endpoint: self.endpoint.clone(),
                remote_shell: self.remote_shell.clone(),
                index: i + 1,
                total,
            };
            let invocation = spec.invocation(
                rsync.clone(),
                self.config.progress_format.as_deref(),
                &self.config.extra_args,
            );
            let job = TransferJob::new(spec, invocation)
                .with_line_capacity(self.config.line_capacity)
                .with_cancellation(cancel.child_token());

            tokio::spawn(forward_job(job, limiter.clone(), job_tx.clone()));
        }
        drop(job_tx);

        let session = self.session.clone();
        let aggregator = tokio::spawn(async move {
            let summary = aggregate(id, total, job_rx, &event_tx, progress_tx).await;
            // Release the session before the event stream ends
            drop(session);
            drop(event_tx);
            summary
        });

        Ok(BatchHandle {
            id,
            total,
            events: event_rx,
            progress: progress_rx,
            cancel,
            aggregator,
        })
    }
}

async fn forward_job(job: TransferJob, limiter: Option<Arc<Semaphore>>, tx: mpsc::Sender<JobMessage>) {
    let _permit = match limiter {
        Some(semaphore) => semaphore.acquire_owned().await.ok(),
        None => None,
    };

    let spec = job.spec().clone();
    let (mut lines, done) = job.start();

    while let Some(line) = lines.next_line().await {
        let _ = tx.send(JobMessage::Line { index: spec.index, line }).await;
    }

    let outcome = match done.wait().await {
        Ok(outcome) => outcome,
        Err(e) => JobOutcome {
            index: spec.index,
            total: spec.total,
            source_path: spec.source_path,
            status: JobStatus::WaitFailed { message: e.to_string() },
            duration_ms: 0,
        },
    };
    let _ = tx.send(JobMessage::Finished(outcome)).await;
}

async fn aggregate(
    batch_id: Uuid,
    total: usize,
    mut jobs: mpsc::Receiver<JobMessage>,
    events: &mpsc::Sender<BatchEvent>,
    progress_tx: watch::Sender<SessionProgress>,
) -> BatchSummary {
    let mut progress = SessionProgress::new(total);
    let mut outcomes = Vec::with_capacity(total);

    while let Some(message) = jobs.recv().await {
        match message {
            JobMessage::Line { index, line } => {
                let _ = events.send(BatchEvent::Line { index, line }).await;
            }
            JobMessage::Finished(outcome) => {
                progress.completed += 1;
                progress_tx.send_replace(progress);
                debug!(
                    "Batch {}: job {} finished, {}/{} complete",
                    batch_id, outcome.index, progress.completed, progress.total
                );

                outcomes.push(outcome.clone());
                let _ = events.send(BatchEvent::JobFinished(outcome)).await;

                if progress.is_complete() {
                    let summary = summarize(batch_id, total, outcomes);
                    info!(
                        "Batch {} complete: {} succeeded, {} failed",
                        batch_id, summary.succeeded, summary.failed
                    );
                    let _ = events.send(BatchEvent::BatchComplete(summary.clone())).await;
                    return summary;
                }
            }
        }
    }

    // Only reachable if a forwarding task died before reporting
    error!("Batch {} lost track of {} job(s)", batch_id, progress.remaining());
    summarize(batch_id, total, outcomes)
}

fn summarize(batch_id: Uuid, total: usize, mut outcomes: Vec<JobOutcome>) -> BatchSummary {
    outcomes.sort_by_key(|outcome| outcome.index);
    let succeeded = outcomes.iter().filter(|outcome| outcome.success()).count();
    BatchSummary {
        batch_id,
        total,
        completed: outcomes.len(),
        succeeded,
        failed: outcomes.len() - succeeded,
        outcomes,
    }
}

#[cfg(test)]
mod tests;
