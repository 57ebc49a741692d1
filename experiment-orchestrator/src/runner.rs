//! Executes one variant's worker under cancellation and a timeout

use experiment_sdk::{Outcome, VariantWorker, WorkerRequest};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs a worker and converts whatever happens into an [`Outcome`].
///
/// Never returns an error: worker failures, timeouts and cancellation all
/// become terminal outcomes so one variant cannot take down the run.
#[derive(Clone)]
pub struct VariantRunner {
    worker: Arc<dyn VariantWorker>,
    timeout: Duration,
}

impl VariantRunner {
    pub fn new(worker: Arc<dyn VariantWorker>, timeout: Duration) -> Self {
        Self { worker, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run(&self, cancel: CancellationToken, request: WorkerRequest) -> Outcome {
        let variant = request.variant.clone();
        let started = Instant::now();
        debug!(variant = %variant, workspace = %request.workspace.display(), "worker starting");

        // Dropping the worker future on cancel/timeout is what stops it;
        // process-backed workers kill their child on drop.
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Outcome::cancelled("cancelled", elapsed_ms(started))
            }
            _ = tokio::time::sleep(self.timeout) => {
                Outcome::cancelled(
                    format!("timed out after {}s", self.timeout.as_secs()),
                    elapsed_ms(started),
                )
            }
            result = self.worker.execute(request) => match result {
                Ok(output) => Outcome::succeeded(output, elapsed_ms(started)),
                Err(e) => Outcome::failed(format!("{:#}", e), elapsed_ms(started)),
            }
        };

        match outcome.status {
            experiment_sdk::VariantStatus::Succeeded => {
                info!(variant = %variant, duration_ms = outcome.duration_ms, "variant succeeded")
            }
            _ => warn!(
                variant = %variant,
                status = %outcome.status,
                duration_ms = outcome.duration_ms,
                summary = %outcome.summary_line(),
                "variant did not succeed"
            ),
        }
        outcome
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
