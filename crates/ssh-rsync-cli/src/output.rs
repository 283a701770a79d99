//! Rendering of batch events on stdout

use anyhow::Result;
use ssh_rsync::{BatchEvent, BatchSummary, JobStatus};
use std::io::Write;

/// Writes batch progress either as plain text or as JSON lines
pub struct Printer<W: Write> {
    out: W,
    json: bool,
}

impl<W: Write> Printer<W> {
    /// Create a printer writing to `out`
    pub fn new(out: W, json: bool) -> Self {
        Self { out, json }
    }

    /// Announce the start of a batch
    pub fn banner(&mut self, total: usize, target: &str) -> Result<()> {
        if self.json {
            let value = serde_json::json!({ "event": "batch_started", "total": total, "target": target });
            writeln!(self.out, "{}", value)?;
        } else {
            writeln!(self.out, "Starting transfer of {} item(s) to {}...", total, target)?;
        }
        self.out.flush()?;
        Ok(())
    }

    /// Print one event
    pub fn event(&mut self, event: &BatchEvent) -> Result<()> {
        if self.json {
            writeln!(self.out, "{}", serde_json::to_string(event)?)?;
            self.out.flush()?;
            return Ok(());
        }

        match event {
            BatchEvent::Line { line, .. } => writeln!(self.out, "{}", line)?,
            BatchEvent::JobFinished(outcome) => match &outcome.status {
                JobStatus::Exited { code: 0 } => {}
                JobStatus::Exited { code } => writeln!(
                    self.out,
                    "[{}/{}] {} failed with exit code {}",
                    outcome.index, outcome.total, outcome.source_path, code
                )?,
                JobStatus::Cancelled => writeln!(
                    self.out,
                    "[{}/{}] {} cancelled",
                    outcome.index, outcome.total, outcome.source_path
                )?,
                other => writeln!(
                    self.out,
                    "[{}/{}] {} did not finish: {:?}",
                    outcome.index, outcome.total, outcome.source_path, other
                )?,
            },
            BatchEvent::BatchComplete(summary) => self.summary(summary)?,
        }
        self.out.flush()?;
        Ok(())
    }

    fn summary(&mut self, summary: &BatchSummary) -> Result<()> {
        if summary.all_succeeded() {
            writeln!(self.out, "All transfers complete!")?;
        } else {
            writeln!(
                self.out,
                "All transfers finished: {} succeeded, {} failed",
                summary.succeeded, summary.failed
            )?;
        }
        Ok(())
    }
}
