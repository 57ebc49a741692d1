//! Worker-facing contract for parallel experiments.
//!
//! A worker receives one variant's instructions plus the workspace it owns and
//! eventually reports a [`WorkerOutput`]. Worker processes talk back to the
//! orchestrator through [`WorkerLog`] events written to stderr.

// Re-export async trait for convenience
pub use async_trait::async_trait;

// Re-exported so `log_metric!` works without a direct serde_json dependency
pub use serde_json;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;

/// Prefix marking a structured event line on a worker's stderr
pub const WORKER_EVENT_PREFIX: &str = "__EXP_EVENT__:";

/// Longest summary line kept for side-by-side comparison
const SUMMARY_LINE_MAX: usize = 120;

/// Lifecycle of a single variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl VariantStatus {
    /// Succeeded, Failed and Cancelled never transition again within a run
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VariantStatus::Succeeded | VariantStatus::Failed | VariantStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VariantStatus::Pending => "pending",
            VariantStatus::Running => "running",
            VariantStatus::Succeeded => "succeeded",
            VariantStatus::Failed => "failed",
            VariantStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for VariantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result recorded for a variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: VariantStatus,
    /// Free-form output returned by the worker
    pub summary: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, Value>,
    /// Present iff `status` is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Outcome {
    pub fn succeeded(output: WorkerOutput, duration_ms: u64) -> Self {
        Self {
            status: VariantStatus::Succeeded,
            summary: output.summary,
            metrics: output.metrics,
            error: None,
            duration_ms,
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        let error = error.into();
        Self {
            status: VariantStatus::Failed,
            summary: format!("failed: {}", error),
            metrics: BTreeMap::new(),
            error: Some(error),
            duration_ms,
        }
    }

    pub fn cancelled(reason: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: VariantStatus::Cancelled,
            summary: reason.into(),
            metrics: BTreeMap::new(),
            error: None,
            duration_ms,
        }
    }

    /// First non-empty line of the summary, truncated for tabular display
    pub fn summary_line(&self) -> String {
        let line = self
            .summary
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("");

        if line.chars().count() > SUMMARY_LINE_MAX {
            let truncated: String = line.chars().take(SUMMARY_LINE_MAX - 3).collect();
            format!("{}...", truncated)
        } else {
            line.to_string()
        }
    }
}

/// Everything a worker needs to attempt one variant
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub experiment: String,
    /// Shared task description, identical for every variant
    pub task: String,
    pub variant: String,
    pub instructions: String,
    /// Working directory exclusively owned by this variant
    pub workspace: PathBuf,
}

/// What a worker hands back on success
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerOutput {
    pub summary: String,
    pub metrics: BTreeMap<String, Value>,
}

impl WorkerOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }
}

/// The external worker capability.
///
/// Any `Fn(WorkerRequest) -> impl Future<Output = anyhow::Result<WorkerOutput>>`
/// is a worker, so tests and embedders can pass a closure.
#[async_trait]
pub trait VariantWorker: Send + Sync {
    async fn execute(&self, request: WorkerRequest) -> anyhow::Result<WorkerOutput>;
}

#[async_trait]
impl<F, Fut> VariantWorker for F
where
    F: Fn(WorkerRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<WorkerOutput>> + Send + 'static,
{
    async fn execute(&self, request: WorkerRequest) -> anyhow::Result<WorkerOutput> {
        (self)(request).await
    }
}

/// Structured events a worker process writes to stderr
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerLog {
    /// Free-form progress note
    Progress { message: String },
    /// Named measurement reported by the worker
    Metric { name: String, value: Value },
    /// Final summary; the last one wins
    Summary { text: String },
}

impl WorkerLog {
    /// Emit this event to stderr for the orchestrator to parse
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            use std::io::Write;
            eprintln!("{}{}", WORKER_EVENT_PREFIX, json);
            // Force flush stderr in async/concurrent contexts
            let _ = std::io::stderr().flush();
        }
    }

    /// Parse one stderr line; `None` for plain output or malformed events
    pub fn parse_line(line: &str) -> Option<Self> {
        line.strip_prefix(WORKER_EVENT_PREFIX)
            .and_then(|json| serde_json::from_str(json).ok())
    }
}

#[macro_export]
macro_rules! log_progress {
    ($msg:expr) => {
        $crate::WorkerLog::Progress {
            message: $msg.to_string(),
        }
        .emit();
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::WorkerLog::Progress {
            message: format!($fmt, $($arg)*),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_metric {
    ($name:expr, $value:expr) => {
        $crate::WorkerLog::Metric {
            name: $name.to_string(),
            value: $crate::serde_json::json!($value),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_summary {
    ($text:expr) => {
        $crate::WorkerLog::Summary {
            text: $text.to_string(),
        }
        .emit();
    };
}
