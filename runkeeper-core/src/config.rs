//! Run configuration.
//!
//! Uses `figment` for layered configuration: defaults -> user config -> run file ->
//! environment -> CLI overrides. A `RunConfig` is read-only once a run is built;
//! the derived [`WriterRole`] and [`ResumeSource`] are resolved from it exactly once.

use crate::error::{ConfigError, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Which phase a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Train,
    Val,
    Test,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Val => "val",
            Phase::Test => "test",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(Phase::Train),
            "val" => Ok(Phase::Val),
            "test" => Ok(Phase::Test),
            other => Err(format!("unknown phase '{other}' (expected train, val or test)")),
        }
    }
}

/// Complete configuration for one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    #[serde(default)]
    pub phase: Phase,
    /// Slot of this process in a distributed run. Rank 0 writes checkpoints.
    #[serde(default)]
    pub global_rank: usize,
    /// Per-phase dataset settings, keyed by phase name.
    #[serde(default = "default_datasets")]
    pub datasets: BTreeMap<String, DatasetConfig>,
    #[serde(default)]
    pub train: TrainConfig,
    #[serde(default)]
    pub path: PathConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            phase: Phase::Train,
            global_rank: 0,
            datasets: default_datasets(),
            train: TrainConfig::default(),
            path: PathConfig::default(),
        }
    }
}

fn default_datasets() -> BTreeMap<String, DatasetConfig> {
    let mut datasets = BTreeMap::new();
    datasets.insert("train".to_string(), DatasetConfig::with_batch_size(8));
    datasets.insert("val".to_string(), DatasetConfig::with_batch_size(8));
    datasets.insert("test".to_string(), DatasetConfig::with_batch_size(1));
    datasets
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DatasetConfig {
    #[serde(default)]
    pub dataloader: DataloaderConfig,
}

impl DatasetConfig {
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            dataloader: DataloaderConfig {
                args: DataloaderArgs { batch_size },
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DataloaderConfig {
    #[serde(default)]
    pub args: DataloaderArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataloaderArgs {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for DataloaderArgs {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    1
}

/// Epoch/iteration limits and checkpoint/validation cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainConfig {
    /// Epoch bound checked before each epoch starts; the loop keeps going
    /// while the current epoch is at most this value, so it ends at `n_epoch + 1`.
    #[serde(default = "default_n_epoch")]
    pub n_epoch: u64,
    /// Iteration ceiling; iterations are advanced by the run's own train step.
    #[serde(default = "default_n_iter")]
    pub n_iter: u64,
    /// Checkpoint every N epochs.
    #[serde(default = "default_save_checkpoint_epoch")]
    pub save_checkpoint_epoch: u64,
    /// Validate every N epochs (when a validation loader exists).
    #[serde(default = "default_val_epoch")]
    pub val_epoch: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            n_epoch: default_n_epoch(),
            n_iter: default_n_iter(),
            save_checkpoint_epoch: default_save_checkpoint_epoch(),
            val_epoch: default_val_epoch(),
        }
    }
}

fn default_n_epoch() -> u64 {
    100
}

fn default_n_iter() -> u64 {
    100_000_000
}

fn default_save_checkpoint_epoch() -> u64 {
    10
}

fn default_val_epoch() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathConfig {
    /// Directory checkpoint files are written to.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint: PathBuf,
    /// Prefix of a previously saved checkpoint, e.g. `checkpoint/20`.
    #[serde(default)]
    pub resume_state: Option<PathBuf>,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            checkpoint: default_checkpoint_dir(),
            resume_state: None,
        }
    }
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoint")
}

impl RunConfig {
    /// Reject configurations the train loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.train.save_checkpoint_epoch == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "train.save_checkpoint_epoch".into(),
            }
            .into());
        }
        if self.train.val_epoch == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "train.val_epoch".into(),
            }
            .into());
        }
        self.batch_size()?;
        Ok(())
    }

    /// Batch size of the active phase's data loader.
    pub fn batch_size(&self) -> Result<usize> {
        self.datasets
            .get(self.phase.as_str())
            .map(|d| d.dataloader.args.batch_size)
            .ok_or_else(|| {
                ConfigError::MissingDataset {
                    phase: self.phase.to_string(),
                }
                .into()
            })
    }

    pub fn writer_role(&self) -> WriterRole {
        WriterRole::from_rank(self.global_rank)
    }

    pub fn resume_source(&self) -> ResumeSource {
        match &self.path.resume_state {
            Some(prefix) => ResumeSource::Prefix(prefix.clone()),
            None => ResumeSource::Fresh,
        }
    }
}

/// Whether this process performs physical checkpoint writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterRole {
    /// Rank 0: the single writer for shared checkpoint artifacts.
    Primary,
    /// Any other rank: checkpoint saves are skipped.
    Replica,
}

impl WriterRole {
    pub fn from_rank(rank: usize) -> Self {
        if rank == 0 {
            WriterRole::Primary
        } else {
            WriterRole::Replica
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, WriterRole::Primary)
    }
}

/// Where a run restores from.
///
/// The prefix must name an exact saved epoch (`<checkpoint dir>/<epoch>`);
/// weights are read from `<prefix>_<label>` and training state from `<prefix>.state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeSource {
    Fresh,
    Prefix(PathBuf),
}

impl ResumeSource {
    pub fn prefix(&self) -> Option<&Path> {
        match self {
            ResumeSource::Fresh => None,
            ResumeSource::Prefix(p) => Some(p),
        }
    }
}

/// Explicit values that win over every other configuration layer.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub phase: Option<Phase>,
    pub global_rank: Option<usize>,
    pub checkpoint_dir: Option<PathBuf>,
    pub resume_state: Option<PathBuf>,
}

impl ConfigOverrides {
    fn apply(&self, mut figment: Figment) -> Figment {
        if let Some(phase) = self.phase {
            figment = figment.merge(("phase", phase));
        }
        if let Some(rank) = self.global_rank {
            figment = figment.merge(("global_rank", rank));
        }
        if let Some(dir) = &self.checkpoint_dir {
            figment = figment.merge(("path.checkpoint", dir));
        }
        if let Some(prefix) = &self.resume_state {
            figment = figment.merge(("path.resume_state", prefix));
        }
        figment
    }
}

/// Load a run configuration from layered sources and validate it.
///
/// Layers, lowest priority first: built-in defaults, the user-level
/// `~/.config/runkeeper/config.toml`, `config_file`, `RUNKEEPER_*` environment
/// variables (`__` separates nesting, e.g. `RUNKEEPER_TRAIN__N_EPOCH=5`),
/// then `overrides`.
pub fn load_config(
    config_file: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<RunConfig> {
    let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "runkeeper", "runkeeper") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("RUNKEEPER_").split("__"));

    extract_config(figment, overrides)
}

/// Apply `overrides` on top of `figment`, extract, and validate.
fn extract_config(mut figment: Figment, overrides: Option<&ConfigOverrides>) -> Result<RunConfig> {
    if let Some(overrides) = overrides {
        figment = overrides.apply(figment);
    }

    let config: RunConfig = figment
        .extract()
        .map_err(|e| ConfigError::Load(Box::new(e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunError;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.phase, Phase::Train);
        assert_eq!(config.global_rank, 0);
        assert_eq!(config.batch_size().unwrap(), 8);
        assert!(config.path.resume_state.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_phase_parse_and_display() {
        assert_eq!("TRAIN".parse::<Phase>().unwrap(), Phase::Train);
        assert_eq!("val".parse::<Phase>().unwrap(), Phase::Val);
        assert!("infer".parse::<Phase>().is_err());
        assert_eq!(Phase::Test.to_string(), "test");
    }

    #[test]
    fn test_writer_role_from_rank() {
        assert_eq!(WriterRole::from_rank(0), WriterRole::Primary);
        assert_eq!(WriterRole::from_rank(3), WriterRole::Replica);
        assert!(!WriterRole::Replica.is_primary());
    }

    #[test]
    fn test_resume_source() {
        let mut config = RunConfig::default();
        assert_eq!(config.resume_source(), ResumeSource::Fresh);
        assert!(config.resume_source().prefix().is_none());

        config.path.resume_state = Some(PathBuf::from("ckpt/20"));
        assert_eq!(
            config.resume_source().prefix(),
            Some(Path::new("ckpt/20"))
        );
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = RunConfig::default();
        config.train.val_epoch = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            RunError::Config(ConfigError::ZeroInterval { ref field }) if field == "train.val_epoch"
        ));

        let mut config = RunConfig::default();
        config.train.save_checkpoint_epoch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_dataset_for_phase() {
        let mut config = RunConfig::default();
        config.datasets.remove("train");
        assert!(matches!(
            config.batch_size(),
            Err(RunError::Config(ConfigError::MissingDataset { .. }))
        ));
    }

    #[test]
    fn test_file_layer_and_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
phase = "train"
global_rank = 2

[datasets.train.dataloader.args]
batch_size = 16

[train]
n_epoch = 3
save_checkpoint_epoch = 1
val_epoch = 2

[path]
checkpoint = "out/ckpt"
"#
        )
        .unwrap();

        let layered = || {
            Figment::from(Serialized::defaults(RunConfig::default())).merge(Toml::file(&path))
        };

        let config = extract_config(layered(), None).unwrap();
        assert_eq!(config.global_rank, 2);
        assert_eq!(config.batch_size().unwrap(), 16);
        assert_eq!(config.train.n_epoch, 3);
        assert_eq!(config.train.n_iter, default_n_iter());
        assert_eq!(config.path.checkpoint, PathBuf::from("out/ckpt"));

        let overrides = ConfigOverrides {
            global_rank: Some(0),
            resume_state: Some(PathBuf::from("out/ckpt/2")),
            ..Default::default()
        };
        let config = extract_config(layered(), Some(&overrides)).unwrap();
        assert_eq!(config.writer_role(), WriterRole::Primary);
        assert_eq!(
            config.resume_source(),
            ResumeSource::Prefix(PathBuf::from("out/ckpt/2"))
        );
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "[train]\nval_epoch = 0\n").unwrap();
        let figment =
            Figment::from(Serialized::defaults(RunConfig::default())).merge(Toml::file(&path));
        assert!(matches!(
            extract_config(figment, None),
            Err(RunError::Config(ConfigError::ZeroInterval { .. }))
        ));
    }
}
