//! Reduce per-variant outcomes into a side-by-side comparison.
//!
//! Aggregation is a pure function of the experiment definition and its variant
//! states: same input, same output, always in variant insertion order.

use experiment_sdk::{Outcome, VariantStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::model::{Experiment, VariantState};

/// Overall result of one orchestrator run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    AllSucceeded,
    /// At least one variant failed and at least one succeeded
    PartialFailure,
    AllFailed,
    /// Caller cancelled before every variant finished
    Aborted,
}

/// One line of the comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateItem {
    pub variant: String,
    pub status: VariantStatus,
    /// One-line summary for human comparison
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub experiment: String,
    pub task: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Variants that never reached a terminal state (aborted runs)
    pub pending: usize,
    pub items: Vec<AggregateItem>,
    pub comparison: String,
}

/// Build the comparison for `experiment` from its variant states.
///
/// Every declared variant yields exactly one item; a variant without a state
/// is reported as pending.
pub fn aggregate(experiment: &Experiment, variants: &[VariantState]) -> AggregateResult {
    let items: Vec<AggregateItem> = experiment
        .variants
        .iter()
        .map(|spec| match variants.iter().find(|v| v.name == spec.name) {
            Some(state) => item_for(state),
            None => AggregateItem {
                variant: spec.name.clone(),
                status: VariantStatus::Pending,
                summary: "not started".to_string(),
                workspace: None,
                outcome: None,
            },
        })
        .collect();

    let count = |status: VariantStatus| items.iter().filter(|i| i.status == status).count();
    let succeeded = count(VariantStatus::Succeeded);
    let failed = count(VariantStatus::Failed);
    let cancelled = count(VariantStatus::Cancelled);
    let pending = items.len() - succeeded - failed - cancelled;

    let comparison = compare(&items);

    AggregateResult {
        experiment: experiment.name.clone(),
        task: experiment.task.clone(),
        total: items.len(),
        succeeded,
        failed,
        cancelled,
        pending,
        items,
        comparison,
    }
}

fn item_for(state: &VariantState) -> AggregateItem {
    let summary = match (&state.outcome, state.status) {
        (Some(outcome), _) => outcome.summary_line(),
        (None, VariantStatus::Running) => "interrupted while running".to_string(),
        (None, _) => "not started".to_string(),
    };

    // Interrupted variants are not terminal, report them as still pending
    let status = match state.status {
        VariantStatus::Running => VariantStatus::Pending,
        other => other,
    };

    AggregateItem {
        variant: state.name.clone(),
        status,
        summary,
        workspace: state.workspace_path.clone(),
        outcome: state.outcome.clone(),
    }
}

fn names_with(items: &[AggregateItem], status: VariantStatus) -> Vec<&str> {
    items
        .iter()
        .filter(|i| i.status == status)
        .map(|i| i.variant.as_str())
        .collect()
}

fn compare(items: &[AggregateItem]) -> String {
    let succeeded = names_with(items, VariantStatus::Succeeded);
    let mut text = format!(
        "{} of {} variants succeeded",
        succeeded.len(),
        items.len()
    );
    if !succeeded.is_empty() {
        let _ = write!(text, " ({})", succeeded.join(", "));
    }

    for (label, status) in [
        ("failed", VariantStatus::Failed),
        ("cancelled", VariantStatus::Cancelled),
        ("pending", VariantStatus::Pending),
    ] {
        let names = names_with(items, status);
        if !names.is_empty() {
            let _ = write!(text, "; {}: {}", label, names.join(", "));
        }
    }

    // First variant wins ties so the text stays deterministic
    let fastest = items
        .iter()
        .filter(|i| i.status == VariantStatus::Succeeded)
        .filter_map(|i| i.outcome.as_ref().map(|o| (i.variant.as_str(), o.duration_ms)))
        .fold(None::<(&str, u64)>, |best, (name, ms)| match best {
            Some((_, best_ms)) if best_ms <= ms => best,
            _ => Some((name, ms)),
        });
    if let Some((name, ms)) = fastest {
        let _ = write!(text, "; fastest success: {} ({})", name, format_duration(ms));
    }

    // Numeric metrics reported by more than one successful variant
    let mut shared: BTreeMap<&str, Vec<(&str, &Value)>> = BTreeMap::new();
    for item in items.iter().filter(|i| i.status == VariantStatus::Succeeded) {
        if let Some(outcome) = &item.outcome {
            for (metric, value) in outcome.metrics.iter().filter(|(_, v)| v.is_number()) {
                shared
                    .entry(metric.as_str())
                    .or_default()
                    .push((item.variant.as_str(), value));
            }
        }
    }
    for (metric, values) in shared.into_iter().filter(|(_, v)| v.len() > 1) {
        let listed: Vec<String> = values
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        let _ = write!(text, "\n{}: {}", metric, listed.join(", "));
    }

    text
}

fn format_duration(ms: u64) -> String {
    if ms < 1_000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

impl AggregateResult {
    pub fn succeeded_variants(&self) -> Vec<&str> {
        names_with(&self.items, VariantStatus::Succeeded)
    }

    pub fn failed_variants(&self) -> Vec<&str> {
        names_with(&self.items, VariantStatus::Failed)
    }

    pub fn cancelled_variants(&self) -> Vec<&str> {
        names_with(&self.items, VariantStatus::Cancelled)
    }

    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }

    /// Overall status; `aborted` is whether the caller cancelled the run
    pub fn run_status(&self, aborted: bool) -> RunStatus {
        if aborted {
            RunStatus::Aborted
        } else if self.succeeded == self.total {
            RunStatus::AllSucceeded
        } else if self.succeeded == 0 {
            RunStatus::AllFailed
        } else {
            RunStatus::PartialFailure
        }
    }

    /// Plain-text comparison table
    pub fn render_text(&self) -> String {
        let name_width = self
            .items
            .iter()
            .map(|i| i.variant.len())
            .max()
            .unwrap_or(0)
            .max("VARIANT".len());

        let mut out = String::new();
        let _ = writeln!(out, "Experiment: {}", self.experiment);
        if !self.task.is_empty() {
            let _ = writeln!(out, "Task: {}", self.task);
        }
        let _ = writeln!(
            out,
            "Result: {} succeeded, {} failed, {} cancelled, {} pending ({} total)",
            self.succeeded, self.failed, self.cancelled, self.pending, self.total
        );
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:<name_width$}  {:<9}  {:>8}  SUMMARY",
            "VARIANT",
            "STATUS",
            "DURATION",
            name_width = name_width
        );
        for item in &self.items {
            let duration = item
                .outcome
                .as_ref()
                .map(|o| format_duration(o.duration_ms))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{:<name_width$}  {:<9}  {:>8}  {}",
                item.variant,
                item.status.as_str(),
                duration,
                item.summary,
                name_width = name_width
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", self.comparison);
        out
    }
}
