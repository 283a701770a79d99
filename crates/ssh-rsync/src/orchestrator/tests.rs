//! Unit tests for the orchestrator

use super::*;
use async_trait::async_trait;
use ssh_rsync_ssh::{CommandOutput, ConnectionInfo, TransportError, TransportType};
use std::sync::Mutex;

/// Transport answering every command with a fixed result
struct MockTransport {
    exit_code: i32,
    stderr: String,
    fail: bool,
    delay: Option<Duration>,
    commands: Mutex<Vec<String>>,
}

impl MockTransport {
    fn exiting(exit_code: i32) -> Self {
        Self {
            exit_code,
            stderr: String::new(),
            fail: false,
            delay: None,
            commands: Mutex::new(Vec::new()),
        }
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, command: &str) -> std::result::Result<CommandOutput, TransportError> {
        self.commands.lock().unwrap().push(command.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(TransportError::Connection("Failed to execute SSH: not found".to_string()));
        }
        Ok(CommandOutput {
            exit_code: self.exit_code,
            stdout: String::new(),
            stderr: self.stderr.clone(),
        })
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: "mock".to_string(),
            port: 22,
            username: "mock".to_string(),
            transport_type: TransportType::Local,
        }
    }
}

fn ssh_config() -> SshConfig {
    SshConfig {
        host: "example.com".to_string(),
        username: "alice".to_string(),
        ..Default::default()
    }
}

fn orchestrator(transport: Arc<MockTransport>, config: TransferConfig) -> Orchestrator {
    Orchestrator::new(ssh_config(), config).with_transport(transport)
}

async fn collect(mut batch: BatchHandle) -> Vec<BatchEvent> {
    let mut events = Vec::new();
    while let Some(event) = batch.next_event().await {
        events.push(event);
    }
    events
}

#[test]
fn test_transfer_config_defaults() {
    let config = TransferConfig::default();
    assert_eq!(config.rsync_path, None);
    assert_eq!(config.ssh_program, PathBuf::from("ssh"));
    assert_eq!(config.progress_format.as_deref(), Some("progress2"));
    assert_eq!(config.max_concurrent_jobs, None);
    assert_eq!(config.line_capacity, DEFAULT_LINE_CAPACITY);
}

#[test]
fn test_transfer_config_builders() {
    let config = TransferConfig::default()
        .with_rsync_path("/opt/homebrew/bin/rsync")
        .with_max_concurrent_jobs(0)
        .with_extra_arg("--partial")
        .with_progress_format(None)
        .with_check_timeout(Duration::from_secs(3));

    assert_eq!(config.rsync_path, Some(PathBuf::from("/opt/homebrew/bin/rsync")));
    assert_eq!(config.max_concurrent_jobs, Some(1));
    assert_eq!(config.extra_args, vec!["--partial"]);
    assert_eq!(config.progress_format, None);
    assert_eq!(config.check_timeout, Duration::from_secs(3));
}

#[test]
fn test_remote_shell_uses_configured_client() {
    let orchestrator = Orchestrator::new(ssh_config(), TransferConfig::default().with_ssh_program("/usr/bin/ssh"));
    assert!(orchestrator.remote_shell().starts_with("/usr/bin/ssh "));
    assert!(orchestrator.remote_shell().contains("BatchMode=yes"));
    assert_eq!(orchestrator.endpoint().target(), "alice@example.com");
}

#[tokio::test]
async fn test_validate_destination_ok() {
    let transport = Arc::new(MockTransport::exiting(0));
    let orchestrator = orchestrator(transport.clone(), TransferConfig::default());

    orchestrator.validate_destination("/srv/my backup").await.unwrap();
    assert_eq!(transport.commands(), vec!["test -d '/srv/my backup'"]);
}

#[tokio::test]
async fn test_validate_destination_not_found() {
    let orchestrator = orchestrator(Arc::new(MockTransport::exiting(1)), TransferConfig::default());

    let err = orchestrator.validate_destination("/missing").await.unwrap_err();
    assert!(matches!(err, RsyncError::NotFound { ref path } if path == "/missing"));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_validate_destination_ssh_failure() {
    let transport = MockTransport {
        stderr: "Host key verification failed.\n".to_string(),
        ..MockTransport::exiting(255)
    };
    let orchestrator = orchestrator(Arc::new(transport), TransferConfig::default());

    match orchestrator.validate_destination("/srv").await {
        Err(RsyncError::CheckFailed { path, reason }) => {
            assert_eq!(path, "/srv");
            assert_eq!(reason, "Host key verification failed.");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_validate_destination_transport_error() {
    let transport = MockTransport {
        fail: true,
        ..MockTransport::exiting(0)
    };
    let orchestrator = orchestrator(Arc::new(transport), TransferConfig::default());

    let err = orchestrator.validate_destination("/srv").await.unwrap_err();
    assert!(matches!(err, RsyncError::CheckFailed { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_validate_destination_timeout() {
    let transport = MockTransport {
        delay: Some(Duration::from_secs(30)),
        ..MockTransport::exiting(0)
    };
    let config = TransferConfig::default().with_check_timeout(Duration::from_millis(50));
    let orchestrator = orchestrator(Arc::new(transport), config);

    let err = orchestrator.validate_destination("/srv").await.unwrap_err();
    assert!(matches!(err, RsyncError::CheckFailed { .. }));
}

#[tokio::test]
async fn test_empty_inputs_rejected_before_checking() {
    let transport = Arc::new(MockTransport::exiting(0));
    let orchestrator = orchestrator(transport.clone(), TransferConfig::default().with_rsync_path("true"));

    let err = orchestrator.start_batch("  ", "/tmp/a").await.unwrap_err();
    assert!(matches!(err, RsyncError::InvalidInput(_)));

    let err = orchestrator.start_batch("/srv", " , ").await.unwrap_err();
    assert!(matches!(err, RsyncError::InvalidInput(_)));

    assert!(transport.commands().is_empty());
}

#[tokio::test]
async fn test_missing_destination_starts_nothing() {
    let orchestrator = orchestrator(
        Arc::new(MockTransport::exiting(1)),
        TransferConfig::default().with_rsync_path("/nonexistent/rsync"),
    );

    let result = orchestrator.start_batch("/missing", "/tmp/a.txt, /tmp/b").await;
    assert!(matches!(result, Err(RsyncError::NotFound { .. })));
}

#[tokio::test]
async fn test_batch_indexes_and_single_completion() {
    let orchestrator = orchestrator(Arc::new(MockTransport::exiting(0)), TransferConfig::default().with_rsync_path("true"));

    let batch = orchestrator.start_batch("/srv", "/tmp/a.txt, /tmp/b").await.unwrap();
    assert_eq!(batch.total(), 2);
    let events = collect(batch).await;

    let completions: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            BatchEvent::BatchComplete(summary) => Some(summary),
            _ => None,
        })
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(matches!(events.last(), Some(BatchEvent::BatchComplete(_))));

    let summary = completions[0];
    assert_eq!(summary.total, 2);
    assert_eq!(summary.completed, 2);
    assert!(summary.all_succeeded());
    assert_eq!(summary.outcomes[0].index, 1);
    assert_eq!(summary.outcomes[0].source_path, "/tmp/a.txt");
    assert_eq!(summary.outcomes[1].index, 2);
    assert_eq!(summary.outcomes[1].source_path, "/tmp/b");
    assert!(summary.outcomes.iter().all(|outcome| outcome.total == 2));

    // Each job's separator precedes its finished event
    for index in 1..=2 {
        let separator = events
            .iter()
            .position(|e| matches!(e, BatchEvent::Line { index: i, line } if *i == index && line.is_empty()))
            .unwrap();
        let finished = events
            .iter()
            .position(|e| matches!(e, BatchEvent::JobFinished(o) if o.index == index))
            .unwrap();
        assert!(separator < finished);
    }
}

#[tokio::test]
async fn test_failed_job_still_completes_batch() {
    let orchestrator = orchestrator(Arc::new(MockTransport::exiting(0)), TransferConfig::default().with_rsync_path("false"));

    let batch = orchestrator.start_batch("/srv", "/tmp/a").await.unwrap();
    let summary = batch.wait().await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.outcomes[0].status, JobStatus::Exited { code: 1 });
    assert!(!summary.all_succeeded());
}

#[tokio::test]
async fn test_progress_reaches_total() {
    let orchestrator = orchestrator(
        Arc::new(MockTransport::exiting(0)),
        TransferConfig::default().with_rsync_path("true").with_max_concurrent_jobs(1),
    );

    let mut batch = orchestrator.start_batch("/srv", "/a, /b, /c").await.unwrap();
    assert_eq!(batch.progress().total, 3);

    while let Some(event) = batch.next_event().await {
        if let BatchEvent::BatchComplete(summary) = event {
            assert_eq!(summary.completed, 3);
        }
    }
    assert_eq!(batch.progress(), SessionProgress { completed: 3, total: 3 });
    assert!(batch.progress().is_complete());
}

#[test]
fn test_session_progress() {
    let mut progress = SessionProgress::new(2);
    assert!(!progress.is_complete());
    assert_eq!(progress.remaining(), 2);
    progress.completed = 2;
    assert!(progress.is_complete());
    assert_eq!(progress.remaining(), 0);
}

#[test]
fn test_batch_event_json() {
    let event = BatchEvent::Line { index: 1, line: "sent 10 bytes".to_string() };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["event"], "line");
    assert_eq!(json["index"], 1);
    assert_eq!(json["line"], "sent 10 bytes");

    let summary = summarize(Uuid::nil(), 1, Vec::new());
    let json = serde_json::to_value(BatchEvent::BatchComplete(summary)).unwrap();
    assert_eq!(json["event"], "batch_complete");
    assert_eq!(json["total"], 1);
    assert_eq!(json["completed"], 0);
}
