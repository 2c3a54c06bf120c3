use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use super::checkpoint::{PipelineCheckpoint, StageCheckpoint};
use crate::coordinator::Snapshot;

pub const DOCUMENT_VERSION: &str = "1";

const STATE_SUFFIX: &str = ".state.json";

/// Errors that can occur during state persistence operations
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid run identifier '{run_id}'")]
    InvalidRunId { run_id: String },

    #[error("State corruption detected: {reason}")]
    StateCorruption { reason: String },

    #[error("Background write task failed: {reason}")]
    TaskFailed { reason: String },
}

/// One document per pipeline run: the snapshot plus the checkpoint set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRun {
    pub version: String,
    pub run_id: String,
    pub host: String,
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub pipeline: Option<PipelineCheckpoint>,
    pub checkpoints: Vec<StageCheckpoint>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedRun {
    pub fn new(
        run_id: impl Into<String>,
        snapshot: Snapshot,
        pipeline: Option<PipelineCheckpoint>,
        checkpoints: Vec<StageCheckpoint>,
    ) -> Self {
        Self {
            version: DOCUMENT_VERSION.to_string(),
            run_id: run_id.into(),
            host: hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            snapshot,
            pipeline,
            checkpoints,
            updated_at: Utc::now(),
        }
    }
}

/// Run identifiers double as file names, so keep them to a safe alphabet
pub fn validate_run_id(run_id: &str) -> Result<(), PersistenceError> {
    let valid = !run_id.is_empty()
        && run_id.len() <= 128
        && !run_id.starts_with('.')
        && !run_id.contains("..")
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidRunId {
            run_id: run_id.to_string(),
        })
    }
}

/// Durable store keyed by run identifier
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait StatePersistence: Send + Sync {
    /// Replace the stored document for `run.run_id`, atomically
    async fn save(&self, run: &PersistedRun) -> Result<(), PersistenceError>;

    async fn load(&self, run_id: &str) -> Result<Option<PersistedRun>, PersistenceError>;

    /// Returns whether a document existed
    async fn remove(&self, run_id: &str) -> Result<bool, PersistenceError>;

    async fn list_runs(&self) -> Result<Vec<String>, PersistenceError>;
}

/// File system implementation: `<dir>/<run_id>.state.json`
#[derive(Debug, Clone)]
pub struct FileSystemPersistence {
    directory: PathBuf,
}

impl FileSystemPersistence {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn state_file_path(&self, run_id: &str) -> PathBuf {
        self.directory.join(format!("{run_id}{STATE_SUFFIX}"))
    }
}

/// Write `contents` over `target` so readers only ever see the old or the new
/// document: temp file in the same directory, fsync, rename, all under an
/// advisory lock shared by every writer of this run.
fn write_atomically(
    directory: &Path,
    run_id: &str,
    target: &Path,
    contents: &[u8],
) -> Result<(), PersistenceError> {
    std::fs::create_dir_all(directory)?;

    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(directory.join(format!("{run_id}.lock")))?;
    let mut lock = fd_lock::RwLock::new(lock_file);
    let _guard = lock.write()?;

    let temp_path = directory.join(format!(
        ".{run_id}.{}.{}.tmp",
        std::process::id(),
        rand::random::<u32>()
    ));

    let written = (|| -> std::io::Result<()> {
        let mut temp = std::fs::File::create(&temp_path)?;
        temp.write_all(contents)?;
        temp.sync_all()?;
        std::fs::rename(&temp_path, target)
    })();

    if let Err(e) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }

    // Make the rename itself durable
    #[cfg(unix)]
    if let Ok(dir) = std::fs::File::open(directory) {
        let _ = dir.sync_all();
    }

    Ok(())
}

#[async_trait]
impl StatePersistence for FileSystemPersistence {
    async fn save(&self, run: &PersistedRun) -> Result<(), PersistenceError> {
        validate_run_id(&run.run_id)?;

        let serialized = serde_json::to_vec_pretty(run)?;
        let directory = self.directory.clone();
        let run_id = run.run_id.clone();
        let target = self.state_file_path(&run.run_id);

        tokio::task::spawn_blocking(move || write_atomically(&directory, &run_id, &target, &serialized))
            .await
            .map_err(|e| PersistenceError::TaskFailed {
                reason: e.to_string(),
            })??;

        debug!(
            run_id = %run.run_id,
            state = %run.snapshot.state,
            checkpoints = run.checkpoints.len(),
            "Run state saved"
        );
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<PersistedRun>, PersistenceError> {
        validate_run_id(run_id)?;

        let state_file = self.state_file_path(run_id);
        let contents = match fs::read_to_string(&state_file).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(run_id = %run_id, file = ?state_file, "No existing state file found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let run: PersistedRun = serde_json::from_str(&contents)?;
        if run.run_id != run_id {
            warn!(
                requested = %run_id,
                stored = %run.run_id,
                "Stored run identifier does not match its file"
            );
            return Err(PersistenceError::StateCorruption {
                reason: format!("file for '{run_id}' holds run '{}'", run.run_id),
            });
        }

        info!(
            run_id = %run_id,
            state = %run.snapshot.state,
            updated_at = %run.updated_at,
            "Run state loaded"
        );
        Ok(Some(run))
    }

    async fn remove(&self, run_id: &str) -> Result<bool, PersistenceError> {
        validate_run_id(run_id)?;

        match fs::remove_file(self.state_file_path(run_id)).await {
            Ok(()) => {
                let _ = fs::remove_file(self.directory.join(format!("{run_id}.lock"))).await;
                info!(run_id = %run_id, "Run state removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_runs(&self) -> Result<Vec<String>, PersistenceError> {
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(run_id) = name.strip_suffix(STATE_SUFFIX) {
                    if !run_id.starts_with('.') {
                        runs.push(run_id.to_string());
                    }
                }
            }
        }
        runs.sort();
        Ok(runs)
    }
}

/// Keeps serialized documents in memory; useful for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    documents: RwLock<HashMap<String, String>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatePersistence for InMemoryPersistence {
    async fn save(&self, run: &PersistedRun) -> Result<(), PersistenceError> {
        validate_run_id(&run.run_id)?;
        let serialized = serde_json::to_string(run)?;
        self.documents.write().await.insert(run.run_id.clone(), serialized);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<PersistedRun>, PersistenceError> {
        validate_run_id(run_id)?;
        match self.documents.read().await.get(run_id) {
            Some(document) => Ok(Some(serde_json::from_str(document)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, run_id: &str) -> Result<bool, PersistenceError> {
        Ok(self.documents.write().await.remove(run_id).is_some())
    }

    async fn list_runs(&self) -> Result<Vec<String>, PersistenceError> {
        let mut runs: Vec<String> = self.documents.read().await.keys().cloned().collect();
        runs.sort();
        Ok(runs)
    }
}
