//! Run one task N ways at once.
//!
//! An [`Experiment`] names a task and several variants of it. The
//! [`Orchestrator`] gives every variant its own workspace, runs a worker per
//! variant with at most `max_parallel` in flight, records each outcome in a
//! [`ProgressStore`] as soon as it lands and finally aggregates the results
//! into a side-by-side comparison. An interrupted run resumes where it stopped.
//!
//! ```no_run
//! use experiment_orchestrator::{Experiment, Orchestrator, OrchestratorConfig, RunOptions};
//! use experiment_orchestrator::worker::CommandWorker;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> experiment_orchestrator::OrchestratorResult<()> {
//! let experiment = Experiment::new("cache-layer", "Add a caching layer to the API")
//!     .variant("in-memory", "Use an in-process LRU map")
//!     .variant("redis", "Use redis as a shared cache")
//!     .variant("hybrid", "L1 in memory, L2 redis")
//!     .max_parallel(2);
//!
//! let config = OrchestratorConfig::for_repo(".").with_env_overrides()?;
//! let worker = CommandWorker::new("./scripts/agent.sh");
//! let orchestrator = Orchestrator::with_defaults(config, Arc::new(worker));
//!
//! let report = orchestrator
//!     .run(&experiment, RunOptions::default(), CancellationToken::new())
//!     .await?;
//! println!("{}", report.aggregate.render_text());
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod runner;
pub mod telemetry;
pub mod worker;
pub mod workspace;

pub use aggregate::{aggregate, AggregateItem, AggregateResult, RunStatus};
pub use config::{load_experiment, OrchestratorConfig, DEFAULT_VARIANT_TIMEOUT_SECS};
pub use error::{OrchestratorError, OrchestratorResult};
pub use events::{EventBus, ExperimentEvent};
pub use model::{Experiment, ExperimentState, ProgressRecord, VariantSpec, VariantState};
pub use orchestrator::{CleanupReport, Orchestrator, RunOptions, RunReport};
pub use progress::{JsonProgressStore, MemoryProgressStore, ProgressStore};
pub use runner::VariantRunner;
pub use workspace::{GitWorktreeProvisioner, WorkspaceProvisioner};

pub use experiment_sdk::{Outcome, VariantStatus, VariantWorker, WorkerOutput, WorkerRequest};
