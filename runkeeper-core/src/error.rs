//! Error types for the Runkeeper core library.
//!
//! Uses `thiserror` for public API error types. Structural incompatibility
//! between a live run and a checkpoint is always surfaced, never retried.

use std::fmt;
use std::path::PathBuf;

/// Top-level error type for the Runkeeper core library.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Wrong lengths of {kind}: checkpoint has {persisted}, run has {live}")]
    StateCountMismatch {
        kind: StateKind,
        persisted: usize,
        live: usize,
    },

    #[error("Strict load failed: missing keys {missing:?}, unexpected keys {unexpected:?}")]
    StrictLoad {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("Shape mismatch for '{key}': expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Invalid state snapshot: {reason}")]
    InvalidSnapshot { reason: String },

    #[error("Malformed checkpoint {path}: {reason}")]
    MalformedCheckpoint { path: PathBuf, reason: String },

    #[error("Step hook failed: {0}")]
    Hook(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RunError {
    pub fn invalid_snapshot(reason: impl Into<String>) -> Self {
        Self::InvalidSnapshot {
            reason: reason.into(),
        }
    }
}

/// Which positional state collection a count mismatch refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Optimizers,
    Schedulers,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKind::Optimizers => write!(f, "optimizers"),
            StateKind::Schedulers => write!(f, "schedulers"),
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration load failed: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("No dataset configured for phase '{phase}'")]
    MissingDataset { phase: String },

    #[error("Interval '{field}' must be at least 1")]
    ZeroInterval { field: String },
}

/// A type alias for results using the top-level `RunError`.
pub type Result<T> = std::result::Result<T, RunError>;
