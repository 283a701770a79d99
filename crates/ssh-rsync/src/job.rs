//! A single rsync transfer

use crate::codec::LineCodec;
use crate::session::RemoteEndpoint;
use crate::sources::display_name;
use crate::{Result, RsyncError};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default capacity of a job's line channel
pub const DEFAULT_LINE_CAPACITY: usize = 256;

/// One source-to-destination transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpec {
    /// Local file or directory
    pub source_path: String,
    /// Directory on the remote host
    pub destination_path: String,
    /// Remote account
    pub endpoint: RemoteEndpoint,
    /// `ssh` command line rsync uses to reach the host with the session key
    pub remote_shell: String,
    /// 1-based position in the batch
    pub index: usize,
    /// Number of transfers in the batch
    pub total: usize,
}

impl TransferSpec {
    /// Short name for log lines
    pub fn display_name(&self) -> &str {
        display_name(&self.source_path)
    }

    /// Build the rsync command line for this transfer
    pub fn invocation(
        &self,
        rsync: impl Into<PathBuf>,
        progress_format: Option<&str>,
        extra_args: &[String],
    ) -> RsyncInvocation {
        let mut args = vec!["-av".to_string()];
        if let Some(format) = progress_format {
            args.push(format!("--info={}", format));
        }
        args.push("-e".to_string());
        args.push(self.remote_shell.clone());
        args.extend(extra_args.iter().cloned());
        args.push(self.source_path.clone());
        args.push(self.endpoint.remote_path(&self.destination_path));

        RsyncInvocation {
            program: rsync.into(),
            args,
        }
    }
}

/// Program and arguments of the external transfer process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsyncInvocation {
    /// Executable to run
    pub program: PathBuf,
    /// Arguments, not shell-interpreted
    pub args: Vec<String>,
}

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, waiting to start
    Pending,
    /// Process launched
    Running,
    /// Process exited and the job reported done
    Completed,
}

impl JobState {
    /// Whether `next` directly follows this state
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running) | (JobState::Running, JobState::Completed)
        )
    }
}

/// How the transfer process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobStatus {
    /// The process exited with a status code
    Exited {
        /// Exit status
        code: i32,
    },
    /// The process was terminated by a signal
    Signaled,
    /// The job was cancelled and its process killed
    Cancelled,
    /// The process could not be launched
    SpawnFailed {
        /// Launch error
        message: String,
    },
    /// Waiting for the process failed
    WaitFailed {
        /// Wait error
        message: String,
    },
}

/// Structured result of a finished job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    /// 1-based position in the batch
    pub index: usize,
    /// Number of transfers in the batch
    pub total: usize,
    /// Local source of the transfer
    pub source_path: String,
    /// How the process ended
    pub status: JobStatus,
    /// Wall time from launch to exit
    pub duration_ms: u64,
}

impl JobOutcome {
    /// Whether rsync exited with status 0
    pub fn success(&self) -> bool {
        self.status == JobStatus::Exited { code: 0 }
    }
}

/// Lines a job emits, in the order its process produced them.
///
/// Ends after the empty separator line that follows process exit.
#[derive(Debug)]
pub struct LineStream {
    index: usize,
    rx: mpsc::Receiver<String>,
}

impl LineStream {
    /// Index of the job this stream belongs to
    pub fn index(&self) -> usize {
        self.index
    }

    /// Wait for the next line; `None` once the job is done emitting
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Collect every remaining line
    pub async fn collect(mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.rx.recv().await {
            lines.push(line);
        }
        lines
    }
}

/// Fires once when a job has completed
#[derive(Debug)]
pub struct DoneSignal {
    rx: oneshot::Receiver<JobOutcome>,
    state: watch::Receiver<JobState>,
}

impl DoneSignal {
    /// Current state of the job
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Wait for the job's outcome
    pub async fn wait(self) -> Result<JobOutcome> {
        self.rx
            .await
            .map_err(|_| RsyncError::Unknown("transfer task ended without reporting".to_string()))
    }
}

/// A transfer backed by one rsync process
#[derive(Debug)]
pub struct TransferJob {
    spec: TransferSpec,
    invocation: RsyncInvocation,
    state: JobState,
    line_capacity: usize,
    cancel: CancellationToken,
}

impl TransferJob {
    /// Create a pending job
    pub fn new(spec: TransferSpec, invocation: RsyncInvocation) -> Self {
        Self {
            spec,
            invocation,
            state: JobState::Pending,
            line_capacity: DEFAULT_LINE_CAPACITY,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the capacity of the line channel
    pub fn with_line_capacity(mut self, capacity: usize) -> Self {
        self.line_capacity = capacity.max(1);
        self
    }

    /// Stop the job when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Transfer description
    pub fn spec(&self) -> &TransferSpec {
        &self.spec
    }

    /// Command line the job runs
    pub fn invocation(&self) -> &RsyncInvocation {
        &self.invocation
    }

    /// Current state
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Launch the process on its own task.
    ///
    /// Must be called within a tokio runtime. Launch failures are reported
    /// through the line stream and the outcome, never as an error here.
    pub fn start(self) -> (LineStream, DoneSignal) {
        let (line_tx, line_rx) = mpsc::channel(self.line_capacity);
        let (done_tx, done_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(self.state);

        let index = self.spec.index;
        tokio::spawn(async move {
            let outcome = self.run(line_tx, &state_tx).await;
            let _ = done_tx.send(outcome);
        });

        (
            LineStream { index, rx: line_rx },
            DoneSignal { rx: done_rx, state: state_rx },
        )
    }

    fn transition(&mut self, next: JobState, state_tx: &watch::Sender<JobState>) {
        debug_assert!(self.state.can_transition_to(next), "{:?} -> {:?}", self.state, next);
        self.state = next;
        state_tx.send_replace(next);
    }

    async fn run(mut self, lines: mpsc::Sender<String>, state_tx: &watch::Sender<JobState>) -> JobOutcome {
        self.transition(JobState::Running, state_tx);
        let started = Instant::now();

        info!(
            "Starting transfer {}/{}: {}",
            self.spec.index, self.spec.total, self.spec.display_name()
        );
        debug!("Running {} {:?}", self.invocation.program.display(), self.invocation.args);

        let status = self.run_process(&lines).await;

        match &status {
            JobStatus::Exited { code: 0 } => info!("Transfer {}/{} finished", self.spec.index, self.spec.total),
            other => warn!("Transfer {}/{} ended: {:?}", self.spec.index, self.spec.total, other),
        }

        let _ = lines.send(String::new()).await;
        drop(lines);

        self.transition(JobState::Completed, state_tx);
        JobOutcome {
            index: self.spec.index,
            total: self.spec.total,
            source_path: self.spec.source_path.clone(),
            status,
            duration_ms: duration_millis(started.elapsed()),
        }
    }

    async fn run_process(&self, lines: &mpsc::Sender<String>) -> JobStatus {
        if self.cancel.is_cancelled() {
            return JobStatus::Cancelled;
        }

        let mut child = match Command::new(&self.invocation.program)
            .args(&self.invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to start {}: {}", self.invocation.program.display(), e);
                let _ = lines.send(message.clone()).await;
                return JobStatus::SpawnFailed { message };
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut cancelled = false;
        tokio::select! {
            _ = async { tokio::join!(pump(stdout, lines), pump(stderr, lines)) } => {}
            _ = self.cancel.cancelled() => cancelled = true,
        }

        let exit = if cancelled {
            kill_and_wait(&mut child).await
        } else {
            tokio::select! {
                status = child.wait() => status,
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    kill_and_wait(&mut child).await
                }
            }
        };

        match exit {
            _ if cancelled => JobStatus::Cancelled,
            Ok(status) => match status.code() {
                Some(code) => JobStatus::Exited { code },
                None => JobStatus::Signaled,
            },
            Err(e) => JobStatus::WaitFailed { message: e.to_string() },
        }
    }
}

async fn kill_and_wait(child: &mut tokio::process::Child) -> std::io::Result<std::process::ExitStatus> {
    if let Err(e) = child.start_kill() {
        debug!("Kill failed, process probably exited: {}", e);
    }
    child.wait().await
}

/// Forward every line of one pipe. Keeps draining after the consumer goes
/// away so the child never blocks on a full pipe.
async fn pump<R>(reader: Option<R>, lines: &mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else { return };
    let mut codec = LineCodec::new();
    let mut consumer_gone = false;

    loop {
        match codec.read_line(&mut reader).await {
            Ok(Some(line)) => {
                if !consumer_gone && lines.send(line).await.is_err() {
                    consumer_gone = true;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading transfer output: {}", e);
                break;
            }
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
