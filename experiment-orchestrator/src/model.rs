//! Data types for experiments and their persisted progress.
//!
//! 1. **Experiment** - the caller's definition: task plus named variants
//! 2. **VariantState** - per-variant lifecycle, workspace and outcome
//! 3. **ProgressRecord** - everything needed to resume, keyed by experiment name

use chrono::{DateTime, Utc};
use experiment_sdk::{Outcome, VariantStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::{OrchestratorError, OrchestratorResult};

fn default_max_parallel() -> usize {
    2
}

// ============================================================================
// Experiment Definition
// ============================================================================

/// One named approach to the experiment's task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub name: String,
    pub instructions: String,
}

/// The unit of work: one task, N variants, a concurrency bound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    /// Unique identifier, also the storage key
    pub name: String,

    /// Task description shared by every variant
    #[serde(default)]
    pub task: String,

    /// Variant name -> instructions, in insertion order
    #[serde(with = "ordered_variants")]
    pub variants: Vec<VariantSpec>,

    /// Maximum number of variants running at once
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Experiment {
    pub fn new(name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            variants: Vec::new(),
            max_parallel: default_max_parallel(),
            created_at: Utc::now(),
        }
    }

    /// Append a variant
    pub fn variant(mut self, name: impl Into<String>, instructions: impl Into<String>) -> Self {
        self.variants.push(VariantSpec {
            name: name.into(),
            instructions: instructions.into(),
        });
        self
    }

    /// Set the concurrency bound
    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn variant_names(&self) -> Vec<&str> {
        self.variants.iter().map(|v| v.name.as_str()).collect()
    }

    /// Check the invariants the orchestrator relies on
    pub fn validate(&self) -> OrchestratorResult<()> {
        validate_storage_key(&self.name)?;

        if self.variants.is_empty() {
            return Err(OrchestratorError::invalid(format!(
                "experiment '{}' has no variants",
                self.name
            )));
        }
        if self.max_parallel == 0 {
            return Err(OrchestratorError::invalid(format!(
                "experiment '{}': max_parallel must be at least 1",
                self.name
            )));
        }

        let mut names = HashSet::new();
        let mut slugs = HashSet::new();
        for variant in &self.variants {
            if variant.name.trim().is_empty() {
                return Err(OrchestratorError::invalid(format!(
                    "experiment '{}' has a variant with an empty name",
                    self.name
                )));
            }
            if !names.insert(variant.name.as_str()) {
                return Err(OrchestratorError::invalid(format!(
                    "duplicate variant name '{}'",
                    variant.name
                )));
            }
            // Workspace directories are named by slug, so slugs must be unique too
            if !slugs.insert(slug(&variant.name)) {
                return Err(OrchestratorError::invalid(format!(
                    "variant '{}' maps to the same workspace as another variant",
                    variant.name
                )));
            }
        }

        Ok(())
    }
}

/// Filesystem- and branch-safe form of a name.
///
/// Names without any ASCII letter or digit are spelled out as the hex of
/// their UTF-8 bytes, so the result is never empty.
pub fn slug(name: &str) -> String {
    let name = name.trim();
    let slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.chars().any(|c| c.is_ascii_alphanumeric()) {
        return slug.to_string();
    }
    let hex: String = name.bytes().map(|b| format!("{:02x}", b)).collect();
    format!("u-{}", hex)
}

/// Experiment names become directory and branch names, so they must already
/// be in slug form
fn validate_storage_key(name: &str) -> OrchestratorResult<()> {
    if name.trim().is_empty() {
        return Err(OrchestratorError::invalid("experiment name is empty"));
    }
    let expected = slug(name);
    if expected != name {
        return Err(OrchestratorError::invalid(format!(
            "experiment name '{}' may only use lowercase letters, digits, '-' and '_' (e.g. '{}')",
            name, expected
        )));
    }
    Ok(())
}

/// Serialize variants as a map while keeping their declaration order
mod ordered_variants {
    use super::VariantSpec;
    use serde::de::{MapAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(variants: &[VariantSpec], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(variants.iter().map(|v| (&v.name, &v.instructions)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<VariantSpec>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct VariantsVisitor;

        impl<'de> Visitor<'de> for VariantsVisitor {
            type Value = Vec<VariantSpec>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of variant name to instructions")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut variants: Vec<VariantSpec> = Vec::new();
                while let Some((name, instructions)) = map.next_entry::<String, String>()? {
                    if variants.iter().any(|v| v.name == name) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate variant name '{}'",
                            name
                        )));
                    }
                    variants.push(VariantSpec { name, instructions });
                }
                Ok(variants)
            }
        }

        deserializer.deserialize_map(VariantsVisitor)
    }
}

// ============================================================================
// Variant State
// ============================================================================

/// Persisted lifecycle of one variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantState {
    pub name: String,
    pub instructions: String,
    pub status: VariantStatus,

    /// Set once provisioned, kept until explicit cleanup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,

    /// Present once terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Number of times a worker was started for this variant
    #[serde(default)]
    pub attempts: u32,
}

impl VariantState {
    pub fn pending(spec: &VariantSpec) -> Self {
        Self {
            name: spec.name.clone(),
            instructions: spec.instructions.clone(),
            status: VariantStatus::Pending,
            workspace_path: None,
            outcome: None,
            started_at: None,
            finished_at: None,
            attempts: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_running(&mut self, workspace: PathBuf) {
        self.status = VariantStatus::Running;
        self.workspace_path = Some(workspace);
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.attempts += 1;
    }

    pub fn finish(&mut self, outcome: Outcome) {
        self.status = outcome.status;
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
    }

    /// Back to `Pending`; the workspace is kept for reuse
    fn reset(&mut self) {
        self.status = VariantStatus::Pending;
        self.outcome = None;
        self.finished_at = None;
    }
}

// ============================================================================
// Progress Record
// ============================================================================

/// Experiment-level lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    NotStarted,
    InProgress,
    Completed,
}

/// Snapshot persisted after every transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub experiment: Experiment,
    pub state: ExperimentState,
    /// Same order as `experiment.variants`
    pub variants: Vec<VariantState>,
    /// Number of orchestrator runs against this record
    #[serde(default)]
    pub runs: u32,
    pub updated_at: DateTime<Utc>,
}

/// What `prepare_resume` decided
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumePlan {
    /// Variants to execute, in insertion order
    pub pending: Vec<String>,
    /// Variants found `Running`, i.e. interrupted by a crash
    pub interrupted: Vec<String>,
}

impl ProgressRecord {
    pub fn new(experiment: Experiment) -> Self {
        let variants = experiment.variants.iter().map(VariantState::pending).collect();
        Self {
            experiment,
            state: ExperimentState::NotStarted,
            variants,
            runs: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.experiment.name
    }

    pub fn variant(&self, name: &str) -> Option<&VariantState> {
        self.variants.iter().find(|v| v.name == name)
    }

    pub fn variant_mut(&mut self, name: &str) -> Option<&mut VariantState> {
        self.variants.iter_mut().find(|v| v.name == name)
    }

    pub fn all_terminal(&self) -> bool {
        self.variants.iter().all(VariantState::is_terminal)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Reject a definition whose variant names differ from the stored ones
    pub fn ensure_matches(&self, experiment: &Experiment) -> OrchestratorResult<()> {
        let stored: Vec<&str> = self.variants.iter().map(|v| v.name.as_str()).collect();
        let requested = experiment.variant_names();
        if stored != requested {
            return Err(OrchestratorError::ExperimentMismatch {
                experiment: experiment.name.clone(),
                detail: format!("stored {:?}, requested {:?}", stored, requested),
            });
        }
        Ok(())
    }

    /// Reset interrupted and retried variants to `Pending` and list what must run.
    ///
    /// Succeeded and Failed variants are skipped unless named in `retry`.
    /// Cancelled variants are skipped unless named or `retry_cancelled` is set.
    pub fn prepare_resume(
        &mut self,
        retry: &[String],
        retry_cancelled: bool,
    ) -> OrchestratorResult<ResumePlan> {
        for name in retry {
            if self.variant(name).is_none() {
                return Err(OrchestratorError::UnknownVariant {
                    experiment: self.experiment.name.clone(),
                    variant: name.clone(),
                });
            }
        }

        let mut plan = ResumePlan::default();
        for variant in &mut self.variants {
            let requested = retry.iter().any(|r| r == &variant.name);
            match variant.status {
                VariantStatus::Pending => {}
                VariantStatus::Running => {
                    plan.interrupted.push(variant.name.clone());
                    variant.reset();
                }
                VariantStatus::Cancelled if retry_cancelled || requested => variant.reset(),
                VariantStatus::Succeeded | VariantStatus::Failed if requested => variant.reset(),
                VariantStatus::Succeeded | VariantStatus::Failed | VariantStatus::Cancelled => {}
            }
            if variant.status == VariantStatus::Pending {
                plan.pending.push(variant.name.clone());
            }
        }

        Ok(plan)
    }
}
