//! # ssh-rsync
//!
//! Establishes passwordless SSH trust with a remote host, then runs one
//! rsync process per selected file or directory, streaming each process's
//! output line by line and reporting when the whole batch has finished.
//!
//! ```no_run
//! use secrecy::SecretString;
//! use ssh_rsync::{BatchEvent, Orchestrator, SessionBuilder, TransferConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> ssh_rsync::Result<()> {
//! let password = SecretString::new("hunter2".to_string());
//! let session = Arc::new(SessionBuilder::new("backup.example.com", "alice").bootstrap(&password).await?);
//!
//! let orchestrator = Orchestrator::for_session(session, TransferConfig::default());
//! let mut batch = orchestrator.start_batch("/home/alice/backup", "/tmp/a.txt, /tmp/b").await?;
//! while let Some(event) = batch.next_event().await {
//!     match event {
//!         BatchEvent::Line { line, .. } => println!("{}", line),
//!         BatchEvent::BatchComplete(_) => break,
//!         BatchEvent::JobFinished(_) => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Error types
pub mod error;

/// Trust bootstrap and session artifacts
pub mod session;

/// Incremental line decoding of process output
pub mod codec;

/// Source path lists
pub mod sources;

/// A single rsync transfer
pub mod job;

/// Batch validation, fan-out and completion tracking
pub mod orchestrator;

/// Discovery of the rsync binary
pub mod locate;

pub use error::RsyncError;
pub use session::{bootstrap, KeyMaterial, RemoteEndpoint, SessionArtifacts, SessionBuilder, TrustedSession};
pub use codec::LineCodec;
pub use sources::SourceList;
pub use job::{DoneSignal, JobOutcome, JobState, JobStatus, LineStream, RsyncInvocation, TransferJob, TransferSpec};
pub use orchestrator::{BatchEvent, BatchHandle, BatchSummary, Orchestrator, SessionProgress, TransferConfig};
pub use locate::find_best_rsync;

/// Result type alias for ssh-rsync operations
pub type Result<T> = std::result::Result<T, RsyncError>;
