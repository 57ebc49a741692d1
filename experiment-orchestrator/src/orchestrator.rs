//! Experiment lifecycle: load or resume progress, provision workspaces,
//! schedule variants under the concurrency bound, persist every transition
//! and aggregate the result.
//!
//! The scheduling loop is the only writer of the [`ProgressRecord`]. Spawned
//! runners hand their [`Outcome`] back to the loop, which persists it and only
//! then releases the variant's concurrency permit.

use experiment_sdk::{Outcome, VariantStatus, VariantWorker, WorkerRequest};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate::{aggregate, AggregateResult, RunStatus};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, ExperimentEvent};
use crate::model::{Experiment, ExperimentState, ProgressRecord, ResumePlan};
use crate::progress::{JsonProgressStore, ProgressStore};
use crate::runner::VariantRunner;
use crate::workspace::{GitWorktreeProvisioner, WorkspaceProvisioner};

/// What an in-flight variant reports back to the scheduling loop
enum Step {
    /// Workspace acquisition finished; the worker has not started yet
    Provisioned {
        name: String,
        workspace: OrchestratorResult<PathBuf>,
    },
    /// The spawned runner finished
    Finished {
        name: String,
        joined: Result<Outcome, JoinError>,
    },
}

/// A variant's pending step together with the permit it holds
type InFlight = BoxFuture<'static, (OwnedSemaphorePermit, Step)>;

/// Everything needed to get a workspace for one variant off the loop
struct WorkspaceRequest {
    provisioner: Arc<dyn WorkspaceProvisioner>,
    experiment: String,
    variant: String,
    base_ref: String,
    /// Path recorded by an earlier run
    existing: Option<PathBuf>,
    /// Left `Running` by a previous run
    interrupted: bool,
    reuse_interrupted: bool,
}

impl WorkspaceRequest {
    async fn acquire(self) -> OrchestratorResult<PathBuf> {
        let Self {
            provisioner,
            experiment,
            variant,
            base_ref,
            existing,
            interrupted,
            reuse_interrupted,
        } = self;

        if let Some(path) = existing {
            let exists = tokio::fs::try_exists(&path).await.map_err(|e| {
                OrchestratorError::provision_failed(
                    &variant,
                    format!("cannot inspect workspace {}: {}", path.display(), e),
                )
            })?;
            if exists {
                if !interrupted || reuse_interrupted {
                    debug!(%experiment, %variant, workspace = %path.display(), "reusing workspace");
                    return Ok(path);
                }
                info!(%experiment, %variant, workspace = %path.display(), "discarding interrupted workspace");
                provisioner.destroy(&path).await?;
            }
        }
        provisioner.provision(&experiment, &variant, &base_ref).await
    }
}

/// Per-run knobs
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Terminal variants to run again
    pub retry: Vec<String>,
    /// Run previously cancelled variants again
    pub retry_cancelled: bool,
    /// Overrides `OrchestratorConfig::base_ref`
    pub base_ref: Option<String>,
}

impl RunOptions {
    pub fn retry<I, S>(mut self, variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry.extend(variants.into_iter().map(Into::into));
        self
    }

    pub fn retry_cancelled(mut self) -> Self {
        self.retry_cancelled = true;
        self
    }

    pub fn base_ref(mut self, base_ref: impl Into<String>) -> Self {
        self.base_ref = Some(base_ref.into());
        self
    }
}

/// What `Orchestrator::run` returns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub aggregate: AggregateResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub destroyed: Vec<String>,
    /// (variant, error)
    pub failed: Vec<(String, String)>,
    /// Variants that had no workspace or were still marked running
    pub skipped: Vec<String>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn ProgressStore>,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    runner: VariantRunner,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn ProgressStore>,
        provisioner: Arc<dyn WorkspaceProvisioner>,
        worker: Arc<dyn VariantWorker>,
    ) -> Self {
        let runner = VariantRunner::new(worker, config.variant_timeout());
        let events = EventBus::new(config.event_capacity);
        Self {
            config,
            store,
            provisioner,
            runner,
            events,
        }
    }

    /// JSON progress under `state_dir`, git worktrees under `workspace_root`
    pub fn with_defaults(config: OrchestratorConfig, worker: Arc<dyn VariantWorker>) -> Self {
        let store = Arc::new(JsonProgressStore::new(&config.state_dir));
        let provisioner = Arc::new(GitWorktreeProvisioner::from_config(&config));
        Self::new(config, store, provisioner, worker)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExperimentEvent> {
        self.events.subscribe()
    }

    /// Run every non-terminal variant of `experiment` and aggregate.
    ///
    /// Resumes from the stored record when one exists. Variant failures are
    /// reported in the result; only progress store errors are returned.
    pub async fn run(
        &self,
        experiment: &Experiment,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> OrchestratorResult<RunReport> {
        experiment.validate()?;
        let run_id = Uuid::new_v4();

        let mut record = match self.store.load(&experiment.name).await? {
            Some(record) => {
                record.ensure_matches(experiment)?;
                info!(experiment = %experiment.name, runs = record.runs, "resuming from stored progress");
                record
            }
            None => ProgressRecord::new(experiment.clone()),
        };

        let plan = record.prepare_resume(&options.retry, options.retry_cancelled)?;
        if !plan.interrupted.is_empty() {
            warn!(
                experiment = %experiment.name,
                interrupted = ?plan.interrupted,
                "variants were left running by a previous run"
            );
        }

        record.runs += 1;
        if !plan.pending.is_empty() {
            record.state = ExperimentState::InProgress;
        }
        self.persist(&mut record).await?;

        info!(
            experiment = %experiment.name,
            %run_id,
            pending = plan.pending.len(),
            total = record.variants.len(),
            max_parallel = experiment.max_parallel,
            "run started"
        );
        self.events.publish(ExperimentEvent::RunStarted {
            experiment: experiment.name.clone(),
            run_id,
            pending: plan.pending.len(),
            total: record.variants.len(),
        });

        let base_ref = options
            .base_ref
            .unwrap_or_else(|| self.config.base_ref.clone());
        let aborted = self
            .schedule(&mut record, plan, experiment.max_parallel, &base_ref, &cancel)
            .await?;

        let aggregate = aggregate(&record.experiment, &record.variants);
        let status = aggregate.run_status(aborted);

        record.state = if record.all_terminal() && !aborted {
            ExperimentState::Completed
        } else {
            ExperimentState::InProgress
        };
        self.persist(&mut record).await?;
        self.store.save_aggregate(&aggregate).await?;

        info!(
            experiment = %experiment.name,
            %run_id,
            ?status,
            succeeded = aggregate.succeeded,
            failed = aggregate.failed,
            cancelled = aggregate.cancelled,
            "run finished"
        );
        self.events.publish(ExperimentEvent::RunFinished {
            experiment: experiment.name.clone(),
            run_id,
            status,
        });

        Ok(RunReport {
            run_id,
            status,
            aggregate,
        })
    }

    /// Drive `plan.pending` to completion; returns whether the run was cancelled.
    ///
    /// A variant holds its permit from provisioning until its outcome is
    /// persisted. Provisioning and workers both run off the loop, so the loop
    /// only ever awaits the progress store.
    async fn schedule(
        &self,
        record: &mut ProgressRecord,
        plan: ResumePlan,
        max_parallel: usize,
        base_ref: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<bool> {
        // Runners observe a child token; leaving early (store failure) stops them all
        let run_cancel = cancel.child_token();
        let _stop_on_exit = run_cancel.clone().drop_guard();

        // Never more permits than variants to run
        let bound = max_parallel.min(plan.pending.len()).max(1);
        let slots = Arc::new(Semaphore::new(bound));
        let mut queue: VecDeque<String> = plan.pending.into();
        let mut in_flight: FuturesUnordered<InFlight> = FuturesUnordered::new();
        let mut aborted = false;
        let mut stopped_by_caller = false;

        while !queue.is_empty() || !in_flight.is_empty() {
            // Checked before every wait: completions are polled first and may
            // keep the cancel branch from ever being chosen
            if !aborted && run_cancel.is_cancelled() {
                aborted = true;
                info!(
                    experiment = %record.name(),
                    not_started = queue.len(),
                    in_flight = in_flight.len(),
                    "run cancelled"
                );
                queue.clear();
                continue;
            }

            tokio::select! {
                biased;

                Some((permit, step)) = in_flight.next(), if !in_flight.is_empty() => match step {
                    Step::Finished { name, joined } => {
                        let outcome = match joined {
                            Ok(outcome) => outcome,
                            Err(e) => Outcome::failed(format!("worker task panicked: {}", e), 0),
                        };
                        // The last runner can finish before the loop sees the token
                        if outcome.status == VariantStatus::Cancelled && run_cancel.is_cancelled() {
                            stopped_by_caller = true;
                        }
                        self.finish_variant(record, &name, outcome).await?;
                        // Slot is released only after the outcome is durable
                        drop(permit);
                    }
                    Step::Provisioned { name, workspace } => {
                        let cancelled = run_cancel.is_cancelled();
                        match self.start_variant(record, &name, workspace, cancelled).await? {
                            Some(request) => {
                                let runner = self.runner.clone();
                                let token = run_cancel.child_token();
                                let handle = tokio::spawn(async move { runner.run(token, request).await });
                                in_flight.push(Box::pin(async move {
                                    (permit, Step::Finished { name, joined: handle.await })
                                }));
                            }
                            // Failed or cancelled before start; the slot goes straight back
                            None => drop(permit),
                        }
                    }
                },

                _ = run_cancel.cancelled(), if !aborted => {}

                permit = slots.clone().acquire_owned(), if !queue.is_empty() && !aborted => {
                    let permit = permit.map_err(|e| {
                        OrchestratorError::invalid(format!("concurrency slots closed: {}", e))
                    })?;
                    let Some(name) = queue.pop_front() else {
                        continue;
                    };
                    let request = WorkspaceRequest {
                        provisioner: self.provisioner.clone(),
                        experiment: record.name().to_string(),
                        variant: name.clone(),
                        base_ref: base_ref.to_string(),
                        existing: record.variant(&name).and_then(|v| v.workspace_path.clone()),
                        interrupted: plan.interrupted.contains(&name),
                        reuse_interrupted: self.config.reuse_interrupted_workspaces,
                    };
                    in_flight.push(Box::pin(async move {
                        let workspace = request.acquire().await;
                        (permit, Step::Provisioned { name, workspace })
                    }));
                }
            }
        }

        Ok(aborted || stopped_by_caller)
    }

    /// Record the provisioning result and mark the variant running.
    ///
    /// Returns `None` when provisioning failed (recorded as `Failed`) or the
    /// run was cancelled meanwhile (variant stays `Pending` with its workspace).
    async fn start_variant(
        &self,
        record: &mut ProgressRecord,
        name: &str,
        workspace: OrchestratorResult<PathBuf>,
        cancelled: bool,
    ) -> OrchestratorResult<Option<WorkerRequest>> {
        let experiment = record.name().to_string();

        let workspace = match workspace {
            Ok(path) => path,
            Err(e) => {
                warn!(experiment = %experiment, variant = name, error = %e, "provisioning failed");
                self.events.publish(ExperimentEvent::VariantProvisionFailed {
                    experiment: experiment.clone(),
                    variant: name.to_string(),
                    error: e.to_string(),
                });
                self.finish_variant(record, name, Outcome::failed(e.to_string(), 0))
                    .await?;
                return Ok(None);
            }
        };

        self.events.publish(ExperimentEvent::VariantProvisioned {
            experiment: experiment.clone(),
            variant: name.to_string(),
            workspace: workspace.clone(),
        });

        let task = record.experiment.task.clone();
        let variant = record
            .variant_mut(name)
            .ok_or_else(|| OrchestratorError::UnknownVariant {
                experiment: experiment.clone(),
                variant: name.to_string(),
            })?;

        if cancelled {
            variant.workspace_path = Some(workspace);
            self.persist(record).await?;
            debug!(experiment = %experiment, variant = name, "cancelled before the worker started");
            return Ok(None);
        }

        variant.mark_running(workspace.clone());
        let attempt = variant.attempts;
        let instructions = variant.instructions.clone();
        self.persist(record).await?;

        info!(experiment = %experiment, variant = name, attempt, workspace = %workspace.display(), "variant started");
        self.events.publish(ExperimentEvent::VariantStarted {
            experiment: experiment.clone(),
            variant: name.to_string(),
            attempt,
        });

        Ok(Some(WorkerRequest {
            experiment,
            task,
            variant: name.to_string(),
            instructions,
            workspace,
        }))
    }

    async fn finish_variant(
        &self,
        record: &mut ProgressRecord,
        name: &str,
        outcome: Outcome,
    ) -> OrchestratorResult<()> {
        let status = outcome.status;
        let duration_ms = outcome.duration_ms;
        if let Some(variant) = record.variant_mut(name) {
            variant.finish(outcome);
        }
        self.persist(record).await?;

        self.events.publish(ExperimentEvent::VariantFinished {
            experiment: record.name().to_string(),
            variant: name.to_string(),
            status,
            duration_ms,
        });
        Ok(())
    }

    async fn persist(&self, record: &mut ProgressRecord) -> OrchestratorResult<()> {
        record.touch();
        self.store.save(record).await
    }

    /// Aggregate of the stored record without running anything
    pub async fn status(&self, experiment: &str) -> OrchestratorResult<Option<AggregateResult>> {
        Ok(self
            .store
            .load(experiment)
            .await?
            .map(|record| aggregate(&record.experiment, &record.variants)))
    }

    /// Names of every experiment with stored progress
    pub async fn list(&self) -> OrchestratorResult<Vec<String>> {
        self.store.list().await
    }

    /// Destroy workspaces of `variants` (all variants when `None`).
    ///
    /// Destroy failures are reported per variant and do not stop the others.
    /// Outcomes are kept; only the workspace path is cleared.
    pub async fn cleanup(
        &self,
        experiment: &str,
        variants: Option<&[String]>,
    ) -> OrchestratorResult<CleanupReport> {
        let mut record = self
            .store
            .load(experiment)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownExperiment(experiment.to_string()))?;

        let targets: Vec<String> = match variants {
            Some(names) => {
                for name in names {
                    if record.variant(name).is_none() {
                        return Err(OrchestratorError::UnknownVariant {
                            experiment: experiment.to_string(),
                            variant: name.clone(),
                        });
                    }
                }
                names.to_vec()
            }
            None => record.variants.iter().map(|v| v.name.clone()).collect(),
        };

        let mut report = CleanupReport::default();
        for name in targets {
            let Some(variant) = record.variant_mut(&name) else {
                continue;
            };
            let workspace = match (&variant.workspace_path, variant.status) {
                (Some(_), VariantStatus::Running) | (None, _) => {
                    report.skipped.push(name);
                    continue;
                }
                (Some(path), _) => path.clone(),
            };

            match self.provisioner.destroy(&workspace).await {
                Ok(()) => {
                    variant.workspace_path = None;
                    self.events.publish(ExperimentEvent::WorkspaceDestroyed {
                        experiment: experiment.to_string(),
                        variant: name.clone(),
                        workspace,
                    });
                    report.destroyed.push(name);
                }
                Err(e) => {
                    warn!(experiment, variant = %name, error = %e, "workspace cleanup failed");
                    self.events.publish(ExperimentEvent::WorkspaceDestroyFailed {
                        experiment: experiment.to_string(),
                        variant: name.clone(),
                        error: e.to_string(),
                    });
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        self.persist(&mut record).await?;
        info!(
            experiment,
            destroyed = report.destroyed.len(),
            failed = report.failed.len(),
            "cleanup finished"
        );
        Ok(report)
    }
}
