//! Error types for experiment orchestration

use std::path::PathBuf;
use thiserror::Error;

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors surfaced by the orchestrator and its collaborators.
///
/// Only `PersistenceFailed` aborts a run. Provision failures are recorded as
/// the variant's outcome, destroy failures are reported and logged.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Experiment definition violates an invariant
    #[error("Invalid experiment: {0}")]
    InvalidExperiment(String),

    /// Stored record disagrees with the definition being resumed
    #[error("Experiment '{experiment}' already exists with different variants: {detail}")]
    ExperimentMismatch { experiment: String, detail: String },

    /// No progress recorded under this name
    #[error("No experiment named '{0}'")]
    UnknownExperiment(String),

    /// Caller named a variant the experiment does not have
    #[error("Experiment '{experiment}' has no variant '{variant}'")]
    UnknownVariant { experiment: String, variant: String },

    /// Workspace could not be created
    #[error("Provision failed for variant '{variant}': {message}")]
    ProvisionFailed { variant: String, message: String },

    /// Workspace could not be removed
    #[error("Destroy failed for {}: {message}", path.display())]
    DestroyFailed { path: PathBuf, message: String },

    /// Progress store unreadable or unwritable
    #[error("Persistence failed for experiment '{experiment}': {message}")]
    PersistenceFailed { experiment: String, message: String },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Create an invalid experiment error
    pub fn invalid(msg: impl Into<String>) -> Self {
        OrchestratorError::InvalidExperiment(msg.into())
    }

    /// Create a provision failed error
    pub fn provision_failed(variant: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestratorError::ProvisionFailed {
            variant: variant.into(),
            message: message.into(),
        }
    }

    /// Create a destroy failed error
    pub fn destroy_failed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        OrchestratorError::DestroyFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a persistence failed error
    pub fn persistence(experiment: impl Into<String>, message: impl ToString) -> Self {
        OrchestratorError::PersistenceFailed {
            experiment: experiment.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        OrchestratorError::Config(msg.into())
    }

    /// Whether this error must stop the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrchestratorError::PersistenceFailed { .. })
    }
}
