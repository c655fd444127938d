//! Crash-recoverable record of which cells are done and which failed.
//!
//! The on-disk document keeps the shape earlier collectors wrote:
//!
//! ```json
//! {"completed": ["11680_202401"], "failed": [{"task": "11650_202401", "error": "HTTP 404"}],
//!  "current": null, "stats": {"total_saved": 3}}
//! ```
//!
//! Older files listing `failed` as bare cell keys (and without `stats`) still load.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use rtms_core::{Cell, CellKey};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::write_atomically;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFile {
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub failed: Vec<FailedEntry>,
    #[serde(default)]
    pub current: Option<String>,
    #[serde(default)]
    pub stats: CheckpointStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FailedEntry {
    Detailed { task: String, error: String },
    Bare(String),
}

impl FailedEntry {
    fn into_parts(self) -> (String, String) {
        match self {
            Self::Detailed { task, error } => (task, error),
            Self::Bare(task) => (task, String::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStats {
    #[serde(default)]
    pub total_saved: u64,
}

/// Typed progress state. A key is never both completed and failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointState {
    completed: BTreeSet<CellKey>,
    failed: BTreeMap<CellKey, String>,
    current: Option<CellKey>,
    total_saved: u64,
}

impl CheckpointState {
    pub fn is_complete(&self, cell: &Cell) -> bool {
        self.completed.contains(&cell.key())
    }

    pub fn is_key_complete(&self, key: &CellKey) -> bool {
        self.completed.contains(key)
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    pub fn failed_len(&self) -> usize {
        self.failed.len()
    }

    pub fn failure_cause(&self, key: &CellKey) -> Option<&str> {
        self.failed.get(key).map(String::as_str)
    }

    pub fn total_saved(&self) -> u64 {
        self.total_saved
    }

    pub fn current(&self) -> Option<&CellKey> {
        self.current.as_ref()
    }

    pub fn set_current(&mut self, key: Option<CellKey>) {
        self.current = key;
    }

    pub fn record_success(&mut self, key: CellKey, saved: u64) {
        self.failed.remove(&key);
        self.completed.insert(key);
        self.total_saved += saved;
    }

    /// A later failure replaces the earlier cause; completed cells stay completed.
    pub fn record_failure(&mut self, key: CellKey, cause: impl Into<String>) {
        if self.completed.contains(&key) {
            return;
        }
        self.failed.insert(key, cause.into());
    }

    /// Drop recorded failures so the next run retries them. Returns how many were cleared.
    pub fn clear_failed(&mut self) -> usize {
        let n = self.failed.len();
        self.failed.clear();
        n
    }

    /// Fold another checkpoint in: completed sets union, saved counts add up,
    /// and failures survive only for cells neither side completed.
    pub fn merge(&mut self, other: CheckpointState) {
        self.completed.extend(other.completed);
        for (key, cause) in other.failed {
            self.failed.entry(key).or_insert(cause);
        }
        let completed = &self.completed;
        self.failed.retain(|key, _| !completed.contains(key));
        self.total_saved += other.total_saved;
    }

    pub fn to_file(&self) -> CheckpointFile {
        CheckpointFile {
            completed: self.completed.iter().map(|k| k.to_string()).collect(),
            failed: self
                .failed
                .iter()
                .map(|(task, error)| FailedEntry::Detailed {
                    task: task.to_string(),
                    error: error.clone(),
                })
                .collect(),
            current: self.current.as_ref().map(|k| k.to_string()),
            stats: CheckpointStats {
                total_saved: self.total_saved,
            },
        }
    }
}

impl From<CheckpointFile> for CheckpointState {
    fn from(file: CheckpointFile) -> Self {
        let completed: BTreeSet<CellKey> = file.completed.into_iter().map(CellKey::from).collect();
        let failed = file
            .failed
            .into_iter()
            .map(FailedEntry::into_parts)
            .map(|(task, error)| (CellKey::from(task), error))
            .filter(|(key, _)| !completed.contains(key))
            .collect();
        Self {
            completed,
            failed,
            current: file.current.map(CellKey::from),
            total_saved: file.stats.total_saved,
        }
    }
}

/// Where checkpoint state lives. An ephemeral checkpoint never touches disk.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: Option<PathBuf>,
}

impl Checkpoint {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn ephemeral() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// An absent file is an empty state; an unreadable one is an error.
    pub async fn load(&self) -> anyhow::Result<CheckpointState> {
        match &self.path {
            Some(path) => Self::load_from(path).await,
            None => Ok(CheckpointState::default()),
        }
    }

    pub async fn load_from(path: &Path) -> anyhow::Result<CheckpointState> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking checkpoint {}", path.display()))?
        {
            return Ok(CheckpointState::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        let file: CheckpointFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing checkpoint {}", path.display()))?;
        Ok(file.into())
    }

    pub async fn save(&self, state: &CheckpointState) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes =
            serde_json::to_vec_pretty(&state.to_file()).context("serializing checkpoint")?;
        write_atomically(path, &bytes)
            .await
            .with_context(|| format!("saving checkpoint {}", path.display()))?;
        debug!(
            path = %path.display(),
            completed = state.completed_len(),
            failed = state.failed_len(),
            "checkpoint saved"
        );
        Ok(())
    }
}
