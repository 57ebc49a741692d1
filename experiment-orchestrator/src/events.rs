//! Lifecycle events published while an experiment runs

use experiment_sdk::VariantStatus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::aggregate::RunStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExperimentEvent {
    RunStarted {
        experiment: String,
        run_id: Uuid,
        pending: usize,
        total: usize,
    },
    VariantProvisioned {
        experiment: String,
        variant: String,
        workspace: PathBuf,
    },
    VariantProvisionFailed {
        experiment: String,
        variant: String,
        error: String,
    },
    VariantStarted {
        experiment: String,
        variant: String,
        attempt: u32,
    },
    /// Emitted after the outcome is persisted
    VariantFinished {
        experiment: String,
        variant: String,
        status: VariantStatus,
        duration_ms: u64,
    },
    WorkspaceDestroyed {
        experiment: String,
        variant: String,
        workspace: PathBuf,
    },
    WorkspaceDestroyFailed {
        experiment: String,
        variant: String,
        error: String,
    },
    RunFinished {
        experiment: String,
        run_id: Uuid,
        status: RunStatus,
    },
}

/// Fan-out of events to any number of observers.
///
/// Publishing never blocks; without subscribers events are dropped and slow
/// subscribers observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ExperimentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExperimentEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ExperimentEvent) {
        let _ = self.tx.send(event);
    }
}
