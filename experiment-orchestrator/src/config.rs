//! Orchestrator configuration and experiment definition loading

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::Experiment;

/// Long-running agent-style workers get half an hour by default
pub const DEFAULT_VARIANT_TIMEOUT_SECS: u64 = 30 * 60;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for an orchestrator instance
///
/// # Examples
///
/// ```no_run
/// use experiment_orchestrator::config::OrchestratorConfig;
///
/// // Defaults rooted at a repository, then environment overrides
/// let config = OrchestratorConfig::for_repo("/src/my-project").with_env_overrides()?;
/// assert_eq!(config.base_ref, "HEAD");
/// # Ok::<(), experiment_orchestrator::OrchestratorError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Where progress records and summaries live, one directory per experiment
    pub state_dir: PathBuf,
    /// Parent of all variant workspaces, one directory per experiment
    pub workspace_root: PathBuf,
    /// Repository the workspaces are cut from
    pub repo_root: PathBuf,
    /// Branch or commit every variant starts from
    pub base_ref: String,
    /// Per-variant worker timeout
    pub variant_timeout_secs: u64,
    /// Hand a crash-interrupted variant its old workspace instead of a fresh one
    pub reuse_interrupted_workspaces: bool,
    /// Buffer size of the lifecycle event channel
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::for_repo(".")
    }
}

impl OrchestratorConfig {
    /// Defaults with state and workspaces under `<repo>/.experiments`
    pub fn for_repo(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let base = repo_root.join(".experiments");
        Self {
            state_dir: base.join("state"),
            workspace_root: base.join("worktrees"),
            repo_root,
            base_ref: "HEAD".to_string(),
            variant_timeout_secs: DEFAULT_VARIANT_TIMEOUT_SECS,
            reuse_interrupted_workspaces: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Load from a YAML file; missing keys take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> OrchestratorResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            OrchestratorError::config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `EXPERIMENT_*` environment variables on top of this config
    pub fn with_env_overrides(self) -> OrchestratorResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> OrchestratorResult<Self> {
        if let Some(dir) = lookup("EXPERIMENT_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("EXPERIMENT_WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(dir);
        }
        if let Some(base_ref) = lookup("EXPERIMENT_BASE_REF") {
            self.base_ref = base_ref;
        }
        if let Some(secs) = lookup("EXPERIMENT_VARIANT_TIMEOUT_SECS") {
            self.variant_timeout_secs = secs.trim().parse().map_err(|_| {
                OrchestratorError::config(format!(
                    "EXPERIMENT_VARIANT_TIMEOUT_SECS must be a number of seconds, got '{}'",
                    secs
                ))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.variant_timeout_secs == 0 {
            return Err(OrchestratorError::config("variant_timeout_secs must be positive"));
        }
        if self.event_capacity == 0 {
            return Err(OrchestratorError::config("event_capacity must be positive"));
        }
        if self.base_ref.trim().is_empty() {
            return Err(OrchestratorError::config("base_ref is empty"));
        }
        Ok(())
    }

    pub fn variant_timeout(&self) -> Duration {
        Duration::from_secs(self.variant_timeout_secs)
    }
}

/// Load an experiment definition from a `.yaml`/`.yml` or `.json` file
pub fn load_experiment(path: impl AsRef<Path>) -> OrchestratorResult<Experiment> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        OrchestratorError::config(format!("failed to read {}: {}", path.display(), e))
    })?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let parsed: Result<Experiment, String> = if is_json {
        serde_json::from_str(&content).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(&content).map_err(|e| e.to_string())
    };
    let experiment = parsed.map_err(|e| {
        OrchestratorError::config(format!("failed to parse {}: {}", path.display(), e))
    })?;

    experiment.validate()?;
    Ok(experiment)
}
