//! Run checkpoints for resumption.
//!
//! After each committed phase the orchestrator can persist the plan and
//! every stored phase result. A later run with the same id restores the
//! results and continues from the first phase not yet completed.
//!
//! ```text
//! <checkpoint_dir>/
//!   run-18c4f2a9b3e-0000.json
//!   run-18c4f2b0c71-0001.json
//! ```

use crate::error::Result;
use crate::memory::PhaseResult;
use crate::phase::ExecutionPlan;
use crate::request::OrchestrationRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Generate a unique run id.
pub fn generate_run_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{ts:x}-{count:04x}")
}

/// Everything needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub run_id: String,
    pub request: OrchestrationRequest,
    pub plan: ExecutionPlan,
    /// Completed phase ids, in execution order.
    pub completed: Vec<String>,
    pub results: Vec<PhaseResult>,
    pub saved_at: DateTime<Utc>,
}

/// Writes and reads run checkpoints under one directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Create a store, ensuring the directory exists.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    pub fn save(&self, checkpoint: &RunCheckpoint) -> Result<PathBuf> {
        let final_path = self.path_for(&checkpoint.run_id);
        let tmp_path = self.dir.join(format!(".{}.json.tmp", checkpoint.run_id));
        let json = serde_json::to_string_pretty(checkpoint)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(final_path)
    }

    /// Load a checkpoint. Returns `None` if the run has none.
    pub fn load(&self, run_id: &str) -> Result<Option<RunCheckpoint>> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Run ids with a checkpoint, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && !stem.starts_with('.')
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete a run's checkpoint. Missing checkpoints are not an error.
    pub fn remove(&self, run_id: &str) -> Result<()> {
        let path = self.path_for(run_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}
