//! Working-tree checkpoints.
//!
//! Before each unit the orchestrator snapshots the working tree so a
//! failed run can roll back. A snapshot is a file map (relative path ->
//! bytes) persisted as JSON under the storage directory, content-hashed
//! with SHA-256. Restore is idempotent: it rewrites tracked files and
//! removes files that appeared after the snapshot.

use crate::PipelineError;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub hash: String,
    pub unit_id: String,
    pub name: String,
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    checkpoint: Checkpoint,
    /// relative path -> base64 file contents
    files: BTreeMap<String, String>,
}

pub struct CheckpointManager {
    repo_path: PathBuf,
    storage_path: PathBuf,
    checkpoints: Mutex<Vec<Checkpoint>>,
}

impl CheckpointManager {
    pub fn new(repo_path: impl Into<PathBuf>, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            storage_path: storage_path.into(),
            checkpoints: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot the working tree. Hidden directories (including the
    /// storage and backup dirs when nested) are left out of the snapshot.
    pub fn create_checkpoint(
        &self,
        name: &str,
        unit_id: &str,
        state: Value,
    ) -> Result<Checkpoint, PipelineError> {
        let files = self.collect_files()?;

        let mut hasher = Sha256::new();
        for (path, contents) in &files {
            hasher.update(path.as_bytes());
            hasher.update(contents.as_bytes());
        }
        let hash = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();

        let checkpoint = Checkpoint {
            checkpoint_id: format!("ckpt-{}", &Uuid::new_v4().simple().to_string()[..8]),
            hash: hash[..16].to_string(),
            unit_id: unit_id.to_string(),
            name: name.to_string(),
            state,
            created_at: Utc::now(),
        };

        std::fs::create_dir_all(&self.storage_path)?;
        let snapshot = Snapshot {
            checkpoint: checkpoint.clone(),
            files,
        };
        let path = self.snapshot_path(&checkpoint.checkpoint_id);
        std::fs::write(&path, serde_json::to_vec(&snapshot)?)?;

        self.checkpoints.lock().push(checkpoint.clone());
        info!(
            checkpoint_id = %checkpoint.checkpoint_id,
            hash = %checkpoint.hash,
            unit_id,
            "Created checkpoint"
        );
        Ok(checkpoint)
    }

    /// Revert the working tree to a snapshot, byte for byte. Files created
    /// after the snapshot are removed; repeat restores are no-ops.
    pub fn restore_checkpoint(&self, checkpoint_id: &str) -> Result<bool, PipelineError> {
        let path = self.snapshot_path(checkpoint_id);
        if !path.exists() {
            warn!(checkpoint_id, "Checkpoint snapshot not found");
            return Ok(false);
        }

        let snapshot: Snapshot = serde_json::from_slice(&std::fs::read(&path)?)?;
        let engine = base64::engine::general_purpose::STANDARD;

        for (rel, encoded) in &snapshot.files {
            let target = self.repo_path.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let bytes = engine
                .decode(encoded)
                .map_err(|e| PipelineError::Checkpoint(format!("corrupt snapshot: {}", e)))?;
            std::fs::write(&target, bytes)?;
        }

        // Remove files that did not exist at snapshot time.
        let current = self.collect_files()?;
        for rel in current.keys() {
            if !snapshot.files.contains_key(rel) {
                let stray = self.repo_path.join(rel);
                debug!(path = %stray.display(), "Removing file not in snapshot");
                let _ = std::fs::remove_file(stray);
            }
        }

        info!(checkpoint_id, "Restored checkpoint");
        Ok(true)
    }

    pub fn get_checkpoint(&self, checkpoint_id: &str) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .iter()
            .find(|c| c.checkpoint_id == checkpoint_id)
            .cloned()
    }

    pub fn get_checkpoint_by_hash(&self, hash: &str) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .iter()
            .find(|c| c.hash == hash)
            .cloned()
    }

    /// Checkpoints in creation order.
    pub fn list_checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.lock().clone()
    }

    fn snapshot_path(&self, checkpoint_id: &str) -> PathBuf {
        self.storage_path.join(format!("{}.json", checkpoint_id))
    }

    fn collect_files(&self) -> Result<BTreeMap<String, String>, PipelineError> {
        let mut files = BTreeMap::new();
        if self.repo_path.exists() {
            self.walk(&self.repo_path.clone(), &mut files)?;
        }
        Ok(files)
    }

    fn walk(&self, dir: &Path, files: &mut BTreeMap<String, String>) -> Result<(), PipelineError> {
        let engine = base64::engine::general_purpose::STANDARD;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();

            if name.starts_with('.') {
                continue;
            }
            if path == self.storage_path {
                continue;
            }

            if path.is_dir() {
                self.walk(&path, files)?;
            } else if path.is_file() {
                let rel = path
                    .strip_prefix(&self.repo_path)
                    .map_err(|_| {
                        PipelineError::Checkpoint(format!(
                            "path escapes repo root: {}",
                            path.display()
                        ))
                    })?
                    .to_string_lossy()
                    .to_string();
                let bytes = std::fs::read(&path)?;
                files.insert(rel, engine.encode(bytes));
            }
        }
        Ok(())
    }
}
