//! Durable experiment progress.
//!
//! The orchestrator saves a [`ProgressRecord`] after every variant transition.
//! [`JsonProgressStore`] keeps one directory per experiment:
//!
//! ```text
//! <root>/<experiment>/progress.json   authoritative record
//! <root>/<experiment>/summary.json    derived aggregate, safe to overwrite
//! <root>/<experiment>/summary.txt     derived comparison table
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! reader never observes a partial record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::aggregate::AggregateResult;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::ProgressRecord;

const PROGRESS_FILE: &str = "progress.json";
const SUMMARY_FILE: &str = "summary.json";
const SUMMARY_TEXT_FILE: &str = "summary.txt";

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// `Ok(None)` when no record exists for `experiment`
    async fn load(&self, experiment: &str) -> OrchestratorResult<Option<ProgressRecord>>;

    /// Atomically replace the stored record
    async fn save(&self, record: &ProgressRecord) -> OrchestratorResult<()>;

    /// Store the derived aggregate next to the record
    async fn save_aggregate(&self, aggregate: &AggregateResult) -> OrchestratorResult<()>;

    /// Names of all stored experiments, sorted
    async fn list(&self) -> OrchestratorResult<Vec<String>>;
}

/// Wrapper that marks the aggregate as derived data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryFile {
    pub derived_from: String,
    pub generated_at: DateTime<Utc>,
    pub aggregate: AggregateResult,
}

/// Filesystem store with one directory per experiment
#[derive(Debug, Clone)]
pub struct JsonProgressStore {
    root: PathBuf,
}

impl JsonProgressStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn experiment_dir(&self, experiment: &str) -> PathBuf {
        self.root.join(experiment)
    }

    pub fn progress_path(&self, experiment: &str) -> PathBuf {
        self.experiment_dir(experiment).join(PROGRESS_FILE)
    }

    pub fn summary_path(&self, experiment: &str) -> PathBuf {
        self.experiment_dir(experiment).join(SUMMARY_FILE)
    }

    /// Read back the derived summary, if one was written
    pub async fn load_summary(&self, experiment: &str) -> OrchestratorResult<Option<SummaryFile>> {
        let path = self.summary_path(experiment);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| OrchestratorError::persistence(experiment, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OrchestratorError::persistence(experiment, e)),
        }
    }
}

/// Write to a hidden temporary sibling, fsync, then rename over `path`
async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }

    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }
    Ok(())
}

#[async_trait]
impl ProgressStore for JsonProgressStore {
    async fn load(&self, experiment: &str) -> OrchestratorResult<Option<ProgressRecord>> {
        let path = self.progress_path(experiment);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(OrchestratorError::persistence(
                    experiment,
                    format!("failed to read {}: {}", path.display(), e),
                ))
            }
        };

        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            OrchestratorError::persistence(
                experiment,
                format!("corrupt record {}: {}", path.display(), e),
            )
        })
    }

    async fn save(&self, record: &ProgressRecord) -> OrchestratorResult<()> {
        let experiment = record.name();
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| OrchestratorError::persistence(experiment, e))?;
        let path = self.progress_path(experiment);

        atomic_write(&path, &bytes).await.map_err(|e| {
            OrchestratorError::persistence(
                experiment,
                format!("failed to write {}: {}", path.display(), e),
            )
        })
    }

    async fn save_aggregate(&self, aggregate: &AggregateResult) -> OrchestratorResult<()> {
        let experiment = aggregate.experiment.as_str();
        let summary = SummaryFile {
            derived_from: PROGRESS_FILE.to_string(),
            generated_at: Utc::now(),
            aggregate: aggregate.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&summary)
            .map_err(|e| OrchestratorError::persistence(experiment, e))?;

        let dir = self.experiment_dir(experiment);
        atomic_write(&dir.join(SUMMARY_FILE), &bytes)
            .await
            .map_err(|e| OrchestratorError::persistence(experiment, e))?;
        atomic_write(
            &dir.join(SUMMARY_TEXT_FILE),
            aggregate.render_text().as_bytes(),
        )
        .await
        .map_err(|e| OrchestratorError::persistence(experiment, e))
    }

    async fn list(&self) -> OrchestratorResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OrchestratorError::persistence("*", e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OrchestratorError::persistence("*", e))?
        {
            if fs::try_exists(entry.path().join(PROGRESS_FILE))
                .await
                .unwrap_or(false)
            {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// In-process store for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    records: Mutex<HashMap<String, ProgressRecord>>,
    aggregates: Mutex<HashMap<String, AggregateResult>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last aggregate saved for `experiment`
    pub async fn aggregate(&self, experiment: &str) -> Option<AggregateResult> {
        self.aggregates.lock().await.get(experiment).cloned()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn load(&self, experiment: &str) -> OrchestratorResult<Option<ProgressRecord>> {
        Ok(self.records.lock().await.get(experiment).cloned())
    }

    async fn save(&self, record: &ProgressRecord) -> OrchestratorResult<()> {
        self.records
            .lock()
            .await
            .insert(record.name().to_string(), record.clone());
        Ok(())
    }

    async fn save_aggregate(&self, aggregate: &AggregateResult) -> OrchestratorResult<()> {
        self.aggregates
            .lock()
            .await
            .insert(aggregate.experiment.clone(), aggregate.clone());
        Ok(())
    }

    async fn list(&self) -> OrchestratorResult<Vec<String>> {
        let mut names: Vec<String> = self.records.lock().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
