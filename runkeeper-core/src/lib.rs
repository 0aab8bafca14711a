//! # Runkeeper Core
//!
//! Lifecycle control for a single neural-network training run: epoch and
//! iteration bookkeeping, checkpointing of network weights and of optimizer
//! and scheduler state, and resuming a run from a saved checkpoint.
//!
//! Networks, optimizers, schedulers, data loaders, and metrics are external
//! collaborators reached through narrow traits ([`Network`], [`Checkpointable`],
//! [`Metric`], [`DevicePlacement`]).

pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod network;
pub mod persistence;
pub mod state;
pub mod tensor;

// Re-export commonly used types at the crate root.
pub use checkpoint::{CheckpointDir, TrainingStateRecord};
pub use config::{ConfigOverrides, Phase, ResumeSource, RunConfig, WriterRole, load_config};
pub use controller::{Lifecycle, LifecycleBuilder, Run, RunResults, RunState, StepLog};
pub use error::{ConfigError, Result, RunError, StateKind};
pub use metrics::Metric;
pub use network::{DataParallel, LoadReport, Network, ParameterSet};
pub use state::{Checkpointable, StateSnapshot};
pub use tensor::{CpuPlacement, Device, DevicePlacement, RankPlacement, StateDict, Tensor};
