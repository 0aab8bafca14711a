//! Checkpoint records and on-disk layout.
//!
//! Under the checkpoint directory, a save at epoch `E` produces:
//! - `E_<label>` per network: the raw weight mapping, tensors on the CPU
//! - `E.state`: `{epoch, iter, schedulers, optimizers}`
//!
//! Resume reads `<prefix>_<label>` and `<prefix>.state` from a caller-supplied
//! prefix, which must already carry the epoch (`<dir>/E`).

use crate::error::{Result, RunError};
use crate::persistence;
use crate::state::StateSnapshot;
use crate::tensor::StateDict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

const STATE_EXTENSION: &str = "state";

/// Combined optimizer/scheduler snapshot plus run counters.
///
/// Both sequences are positional: entry `i` belongs to the run's `i`-th
/// optimizer (scheduler). There is no identity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStateRecord {
    pub epoch: u64,
    pub iter: u64,
    pub schedulers: Vec<StateSnapshot>,
    pub optimizers: Vec<StateSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

pub fn network_file(dir: &Path, epoch: u64, label: &str) -> PathBuf {
    dir.join(format!("{epoch}_{label}"))
}

pub fn state_file(dir: &Path, epoch: u64) -> PathBuf {
    dir.join(format!("{epoch}.{STATE_EXTENSION}"))
}

pub fn resume_network_file(prefix: &Path, label: &str) -> PathBuf {
    with_suffix(prefix, &format!("_{label}"))
}

pub fn resume_state_file(prefix: &Path) -> PathBuf {
    with_suffix(prefix, &format!(".{STATE_EXTENSION}"))
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

pub fn write_weights(path: &Path, weights: &StateDict) -> Result<()> {
    persistence::atomic_write_json(path, weights)?;
    Ok(())
}

/// Read a weight mapping; `Ok(None)` if the file does not exist.
pub fn read_weights(path: &Path) -> Result<Option<StateDict>> {
    persistence::load_json(path).map_err(|e| malformed(path, e))
}

pub fn write_training_state(path: &Path, record: &TrainingStateRecord) -> Result<()> {
    persistence::atomic_write_json(path, record)?;
    Ok(())
}

/// Read a training state record; `Ok(None)` if the file does not exist.
pub fn read_training_state(path: &Path) -> Result<Option<TrainingStateRecord>> {
    persistence::load_json(path).map_err(|e| malformed(path, e))
}

fn malformed(path: &Path, err: io::Error) -> RunError {
    if err.kind() == io::ErrorKind::InvalidData {
        RunError::MalformedCheckpoint {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    } else {
        RunError::Io(err)
    }
}

/// Read-only view of a checkpoint directory.
#[derive(Debug, Clone)]
pub struct CheckpointDir {
    root: PathBuf,
}

impl CheckpointDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Epochs that have a training state file, ascending.
    pub fn saved_epochs(&self) -> Result<Vec<u64>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut epochs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STATE_EXTENSION) {
                continue;
            }
            if let Some(epoch) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                epochs.push(epoch);
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    /// Network labels saved at `epoch`, sorted.
    pub fn network_labels(&self, epoch: u64) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let marker = format!("{epoch}_");
        let mut labels = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".tmp") {
                continue;
            }
            if let Some(label) = name.strip_prefix(&marker) {
                if !label.is_empty() {
                    labels.push(label.to_string());
                }
            }
        }
        labels.sort();
        Ok(labels)
    }

    /// Resume prefix of the most recent saved epoch.
    pub fn latest_prefix(&self) -> Result<Option<PathBuf>> {
        Ok(self
            .saved_epochs()?
            .last()
            .map(|epoch| self.root.join(epoch.to_string())))
    }
}
