//! Build progress reporting.
//!
//! Two sides:
//!
//! - **Producing**: the pipeline reports stage transitions and document
//!   counts to a [`ProgressSink`] passed explicitly per call.
//!   [`TaskProgressSink`] persists them to the build task and the
//!   environment row so pollers in other requests see them.
//! - **Watching**: `ixr build --wait` polls the task and renders each change
//!   through a [`BuildProgressReporter`] on **stderr** so stdout stays
//!   parseable for scripts.

use std::io::Write;

use async_trait::async_trait;

use index_release_core::models::{BuildTask, EnvironmentType};

use crate::environment::EnvironmentStore;
use crate::task::TaskStore;

/// Receives progress from a running build.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// A named stage began at `percent`.
    async fn stage(&self, percent: u8, message: &str);
    /// `indexed` of `total` documents have been written.
    async fn documents(&self, indexed: u64, total: u64);
}

/// Maps document progress into a sub-range of the overall percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressBand {
    pub start: u8,
    pub end: u8,
}

impl ProgressBand {
    pub fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    /// `start + (end - start) * indexed / total`. An empty load maps to `end`.
    pub fn map(&self, indexed: u64, total: u64) -> u8 {
        if total == 0 {
            return self.end;
        }
        let span = u64::from(self.end.saturating_sub(self.start));
        let done = indexed.min(total);
        self.start + (span * done / total) as u8
    }
}

/// Persists progress for one build.
pub struct TaskProgressSink {
    tasks: TaskStore,
    environments: EnvironmentStore,
    task_id: String,
    environment: EnvironmentType,
    version: String,
    band: ProgressBand,
}

impl TaskProgressSink {
    pub fn new(
        tasks: TaskStore,
        environments: EnvironmentStore,
        task_id: String,
        environment: EnvironmentType,
        version: String,
        band: ProgressBand,
    ) -> Self {
        Self {
            tasks,
            environments,
            task_id,
            environment,
            version,
            band,
        }
    }
}

#[async_trait]
impl ProgressSink for TaskProgressSink {
    async fn stage(&self, percent: u8, message: &str) {
        tracing::info!(task_id = %self.task_id, percent, "{}", message);
        if let Err(e) = self.tasks.update_progress(&self.task_id, percent, message).await {
            tracing::warn!(task_id = %self.task_id, error = %e, "failed to record task progress");
        }
    }

    async fn documents(&self, indexed: u64, total: u64) {
        let percent = self.band.map(indexed, total);
        let message = format!(
            "indexed {} / {} documents",
            format_number(indexed),
            format_number(total)
        );
        tracing::debug!(task_id = %self.task_id, indexed, total, percent, "load progress");
        if let Err(e) = self.tasks.update_progress(&self.task_id, percent, &message).await {
            tracing::warn!(task_id = %self.task_id, error = %e, "failed to record task progress");
        }
        if let Err(e) = self
            .environments
            .update_progress(self.environment, &self.version, indexed, total)
            .await
        {
            tracing::warn!(environment = %self.environment, error = %e, "failed to record environment progress");
        }
    }
}

/// Discards all progress.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn stage(&self, _percent: u8, _message: &str) {}
    async fn documents(&self, _indexed: u64, _total: u64) {}
}

/// Renders polled task snapshots for the CLI.
pub trait BuildProgressReporter: Send + Sync {
    fn report(&self, task: &BuildTask);
}

/// Human-friendly progress on stderr: "build STAGING v20240101120000   45%  indexed 1,234 / 5,000 documents".
pub struct StderrProgress;

impl BuildProgressReporter for StderrProgress {
    fn report(&self, task: &BuildTask) {
        let line = format!(
            "build {} {}  {:>3}%  {}\n",
            task.environment_type, task.version, task.progress_percent, task.message
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BuildProgressReporter for JsonProgress {
    fn report(&self, task: &BuildTask) {
        let obj = serde_json::json!({
            "event": "progress",
            "task_id": task.id,
            "environment": task.environment_type,
            "version": task.version,
            "percent": task.progress_percent,
            "status": task.status,
            "message": task.message,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct SilentProgress;

impl BuildProgressReporter for SilentProgress {
    fn report(&self, _task: &BuildTask) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn BuildProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(SilentProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
