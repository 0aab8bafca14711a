//! Run lifecycle controller.
//!
//! [`Lifecycle`] owns the bookkeeping of one run: epoch/iteration counters,
//! the positional optimizer and scheduler collections, data loaders, and the
//! checkpoint save/resume operations. A concrete run embeds a `Lifecycle` and
//! implements [`Run`], which supplies the required training hooks and drives
//! the epoch loop.
//!
//! State flow: built → optionally resumed (`load_everything`) → training epochs
//! with interleaved checkpointing and validation → done when a limit is hit.

use crate::checkpoint::{self, TrainingStateRecord};
use crate::config::{Phase, ResumeSource, RunConfig, WriterRole};
use crate::error::{Result, RunError, StateKind};
use crate::metrics::Metric;
use crate::network::{LoadReport, Network, underlying, with_underlying_mut};
use crate::state::{Checkpointable, StateSnapshot};
use crate::tensor::{CpuPlacement, DevicePlacement, StateDict, Tensor, place_all};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Epoch and iteration counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub epoch: u64,
    pub iter: u64,
}

/// A name → value record emitted by a train or validation step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepLog(BTreeMap<String, f64>);

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stamp the run counters onto the record, replacing same-named entries.
    pub fn record_counters(&mut self, epoch: u64, iter: u64) {
        self.insert("epoch", epoch as f64);
        self.insert("iters", iter as f64);
    }
}

impl FromIterator<(String, f64)> for StepLog {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Named outputs a run collects for later saving or inspection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResults {
    pub name: Vec<String>,
    pub result: Vec<Tensor>,
}

impl RunResults {
    pub fn push(&mut self, name: impl Into<String>, result: Tensor) {
        self.name.push(name.into());
        self.result.push(result);
    }

    pub fn clear(&mut self) {
        self.name.clear();
        self.result.clear();
    }

    pub fn len(&self) -> usize {
        self.name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.name.iter().zip(&self.result)
    }
}

/// Builder for [`Lifecycle`]. Optimizers and schedulers can only be
/// registered here; their count and order are fixed once built.
pub struct LifecycleBuilder<D, O, S> {
    config: RunConfig,
    phase_loader: D,
    val_loader: Option<D>,
    metrics: Vec<Box<dyn Metric>>,
    optimizers: Vec<O>,
    schedulers: Vec<S>,
    placement: Option<Box<dyn DevicePlacement>>,
}

impl<D, O, S> LifecycleBuilder<D, O, S>
where
    O: Checkpointable,
    S: Checkpointable,
{
    pub fn val_loader(mut self, loader: D) -> Self {
        self.val_loader = Some(loader);
        self
    }

    pub fn metric(mut self, metric: impl Metric + 'static) -> Self {
        self.metrics.push(Box::new(metric));
        self
    }

    /// Register the next optimizer; its position is its identity in checkpoints.
    pub fn optimizer(mut self, optimizer: O) -> Self {
        self.optimizers.push(optimizer);
        self
    }

    /// Register the next scheduler; its position is its identity in checkpoints.
    pub fn scheduler(mut self, scheduler: S) -> Self {
        self.schedulers.push(scheduler);
        self
    }

    /// Device policy applied to every tensor loaded from a checkpoint.
    /// Defaults to the CPU.
    pub fn placement(mut self, placement: impl DevicePlacement + 'static) -> Self {
        self.placement = Some(Box::new(placement));
        self
    }

    pub fn build(self) -> Result<Lifecycle<D, O, S>> {
        self.config.validate()?;
        let batch_size = self.config.batch_size()?;
        let role = self.config.writer_role();
        let resume = self.config.resume_source();

        debug!(
            phase = %self.config.phase,
            rank = self.config.global_rank,
            ?role,
            ?resume,
            batch_size,
            optimizers = self.optimizers.len(),
            schedulers = self.schedulers.len(),
            "Built run lifecycle"
        );

        Ok(Lifecycle {
            config: self.config,
            role,
            resume,
            placement: self
                .placement
                .unwrap_or_else(|| Box::new(CpuPlacement)),
            batch_size,
            state: RunState::default(),
            phase_loader: self.phase_loader,
            val_loader: self.val_loader,
            metrics: self.metrics,
            optimizers: self.optimizers,
            schedulers: self.schedulers,
            results: RunResults::default(),
            train_log: None,
            val_log: None,
        })
    }
}

/// Bookkeeping and checkpoint operations of a single run.
pub struct Lifecycle<D, O, S> {
    config: RunConfig,
    role: WriterRole,
    resume: ResumeSource,
    placement: Box<dyn DevicePlacement>,
    batch_size: usize,
    state: RunState,
    phase_loader: D,
    val_loader: Option<D>,
    metrics: Vec<Box<dyn Metric>>,
    optimizers: Vec<O>,
    schedulers: Vec<S>,
    results: RunResults,
    train_log: Option<StepLog>,
    val_log: Option<StepLog>,
}

impl<D, O, S> Lifecycle<D, O, S>
where
    O: Checkpointable,
    S: Checkpointable,
{
    pub fn builder(config: RunConfig, phase_loader: D) -> LifecycleBuilder<D, O, S> {
        LifecycleBuilder {
            config,
            phase_loader,
            val_loader: None,
            metrics: Vec::new(),
            optimizers: Vec::new(),
            schedulers: Vec::new(),
            placement: None,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.config.phase
    }

    pub fn role(&self) -> WriterRole {
        self.role
    }

    pub fn resume_source(&self) -> &ResumeSource {
        &self.resume
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.state.epoch
    }

    pub fn iter(&self) -> u64 {
        self.state.iter
    }

    /// Advance the iteration counter. Called from a run's train step; the
    /// epoch loop itself never touches it.
    pub fn advance_iter(&mut self, by: u64) {
        self.state.iter = self.state.iter.saturating_add(by);
    }

    pub fn phase_loader(&self) -> &D {
        &self.phase_loader
    }

    pub fn phase_loader_mut(&mut self) -> &mut D {
        &mut self.phase_loader
    }

    pub fn val_loader(&self) -> Option<&D> {
        self.val_loader.as_ref()
    }

    pub fn val_loader_mut(&mut self) -> Option<&mut D> {
        self.val_loader.as_mut()
    }

    pub fn metrics(&self) -> &[Box<dyn Metric>] {
        &self.metrics
    }

    pub fn optimizers(&self) -> &[O] {
        &self.optimizers
    }

    pub fn optimizers_mut(&mut self) -> &mut [O] {
        &mut self.optimizers
    }

    pub fn schedulers(&self) -> &[S] {
        &self.schedulers
    }

    pub fn schedulers_mut(&mut self) -> &mut [S] {
        &mut self.schedulers
    }

    /// Both positional collections at once, for schedulers that adjust an
    /// optimizer in place.
    pub fn optimizers_and_schedulers_mut(&mut self) -> (&mut [O], &mut [S]) {
        (&mut self.optimizers, &mut self.schedulers)
    }

    pub fn results(&self) -> &RunResults {
        &self.results
    }

    pub fn results_mut(&mut self) -> &mut RunResults {
        &mut self.results
    }

    pub fn last_train_log(&self) -> Option<&StepLog> {
        self.train_log.as_ref()
    }

    pub fn last_val_log(&self) -> Option<&StepLog> {
        self.val_log.as_ref()
    }

    /// Move a tensor to this process's target device.
    pub fn set_device(&self, tensor: Tensor) -> Tensor {
        self.placement.place(tensor)
    }

    /// True while the current epoch has not passed `n_epoch` and the
    /// iteration counter has not passed `n_iter`.
    pub fn should_continue(&self) -> bool {
        let train = &self.config.train;
        self.state.epoch <= train.n_epoch && self.state.iter <= train.n_iter
    }

    fn is_checkpoint_epoch(&self) -> bool {
        self.state.epoch % self.config.train.save_checkpoint_epoch == 0
    }

    fn is_validation_epoch(&self) -> bool {
        self.state.epoch % self.config.train.val_epoch == 0
    }

    /// Persist `network`'s weights as `<checkpoint>/<epoch>_<label>`.
    ///
    /// Only the primary writer touches the filesystem. Data-parallel wrappers
    /// are unwrapped and every tensor is moved to the CPU first.
    pub fn save_network(&self, network: &dyn Network, label: &str) -> Result<()> {
        if !self.role.is_primary() {
            debug!(
                rank = self.config.global_rank,
                label, "Skipping network save on non-primary rank"
            );
            return Ok(());
        }

        let weights: StateDict = underlying(network)
            .state_dict()
            .into_iter()
            .map(|(key, tensor)| (key, tensor.cpu()))
            .collect();
        let path = checkpoint::network_file(&self.config.path.checkpoint, self.state.epoch, label);
        checkpoint::write_weights(&path, &weights)?;

        info!(
            epoch = self.state.epoch,
            label,
            tensors = weights.len(),
            path = %path.display(),
            "Saved network weights"
        );
        Ok(())
    }

    /// Load `<resume prefix>_<label>` into `network`.
    ///
    /// Returns `Ok(None)` without touching the network when no resume prefix
    /// is configured or the file does not exist. With `strict`, any key
    /// mismatch fails the load.
    pub fn load_network(
        &self,
        network: &mut dyn Network,
        label: &str,
        strict: bool,
    ) -> Result<Option<LoadReport>> {
        let Some(prefix) = self.resume.prefix() else {
            debug!(label, "No resume prefix configured, skipping network load");
            return Ok(None);
        };

        let path = checkpoint::resume_network_file(prefix, label);
        let Some(weights) = checkpoint::read_weights(&path)? else {
            debug!(label, path = %path.display(), "Network checkpoint not found, skipping load");
            return Ok(None);
        };

        let weights = place_all(self.placement.as_ref(), weights);
        let report = with_underlying_mut(network, |net| net.load_state_dict(weights, strict))?;

        if !report.is_exact() {
            warn!(
                label,
                missing = ?report.missing_keys,
                unexpected = ?report.unexpected_keys,
                "Loaded network weights with mismatched keys"
            );
        }
        info!(label, path = %path.display(), "Loaded network weights");
        Ok(Some(report))
    }

    /// Persist counters plus every optimizer and scheduler snapshot as
    /// `<checkpoint>/<epoch>.state`. Only the primary writer writes.
    pub fn save_training_state(&self) -> Result<()> {
        if !self.role.is_primary() {
            debug!(
                rank = self.config.global_rank,
                "Skipping training state save on non-primary rank"
            );
            return Ok(());
        }

        let record = TrainingStateRecord {
            epoch: self.state.epoch,
            iter: self.state.iter,
            schedulers: self.schedulers.iter().map(|s| s.state_dict()).collect(),
            optimizers: self.optimizers.iter().map(|o| o.state_dict()).collect(),
            saved_at: Some(chrono::Utc::now()),
        };
        let path = checkpoint::state_file(&self.config.path.checkpoint, self.state.epoch);
        checkpoint::write_training_state(&path, &record)?;

        info!(
            epoch = record.epoch,
            iter = record.iter,
            path = %path.display(),
            "Saved training state"
        );
        Ok(())
    }

    /// Restore optimizers, schedulers, and counters from `<resume prefix>.state`.
    ///
    /// A no-op (returning `false`) outside the train phase, without a resume
    /// prefix, or when the state file is absent. Snapshot counts must equal
    /// the live counts; snapshots are applied by position and the counters are
    /// replaced wholesale. If any snapshot is rejected, every optimizer and
    /// scheduler is put back to its pre-resume state and the counters are left
    /// untouched.
    pub fn resume_training(&mut self) -> Result<bool> {
        if self.config.phase != Phase::Train {
            debug!(phase = %self.config.phase, "Not training, skipping resume");
            return Ok(false);
        }
        let Some(prefix) = self.resume.prefix() else {
            debug!("No resume prefix configured, skipping resume");
            return Ok(false);
        };

        let path = checkpoint::resume_state_file(prefix);
        let Some(record) = checkpoint::read_training_state(&path)? else {
            debug!(path = %path.display(), "Training state not found, skipping resume");
            return Ok(false);
        };

        if record.optimizers.len() != self.optimizers.len() {
            return Err(RunError::StateCountMismatch {
                kind: StateKind::Optimizers,
                persisted: record.optimizers.len(),
                live: self.optimizers.len(),
            });
        }
        if record.schedulers.len() != self.schedulers.len() {
            return Err(RunError::StateCountMismatch {
                kind: StateKind::Schedulers,
                persisted: record.schedulers.len(),
                live: self.schedulers.len(),
            });
        }

        let optimizer_backup: Vec<StateSnapshot> =
            self.optimizers.iter().map(|o| o.state_dict()).collect();
        let scheduler_backup: Vec<StateSnapshot> =
            self.schedulers.iter().map(|s| s.state_dict()).collect();

        let placement = self.placement.as_ref();
        let optimizers = record.optimizers.into_iter().map(|s| s.placed(placement)).collect();
        let schedulers = record.schedulers.into_iter().map(|s| s.placed(placement)).collect();
        if let Err(err) = self.apply_snapshots(optimizers, schedulers) {
            if let Err(restore_err) = self.apply_snapshots(optimizer_backup, scheduler_backup) {
                warn!(error = %restore_err, "Could not restore state after failed resume");
            }
            return Err(err);
        }

        let previous = self.state;
        self.state = RunState {
            epoch: record.epoch,
            iter: record.iter,
        };

        info!(
            epoch = self.state.epoch,
            iter = self.state.iter,
            previous_epoch = previous.epoch,
            path = %path.display(),
            "Resumed training state"
        );
        Ok(true)
    }

    /// Load snapshots into the live optimizers and schedulers by position.
    fn apply_snapshots(
        &mut self,
        optimizers: Vec<StateSnapshot>,
        schedulers: Vec<StateSnapshot>,
    ) -> Result<()> {
        for (optimizer, snapshot) in self.optimizers.iter_mut().zip(optimizers) {
            optimizer.load_state_dict(snapshot)?;
        }
        for (scheduler, snapshot) in self.schedulers.iter_mut().zip(schedulers) {
            scheduler.load_state_dict(snapshot)?;
        }
        Ok(())
    }

    fn begin_epoch(&mut self) -> u64 {
        self.state.epoch += 1;
        self.state.epoch
    }
}

/// A concrete run: its networks, data handling, and the three required hooks.
///
/// The provided [`Run::train`] loop increments the epoch, calls
/// [`Run::train_step`], checkpoints through [`Run::save_everything`] every
/// `save_checkpoint_epoch` epochs, and calls [`Run::val_step`] every
/// `val_epoch` epochs when a validation loader is present.
pub trait Run {
    type Data;
    type Optimizer: Checkpointable;
    type Scheduler: Checkpointable;

    fn lifecycle(&self) -> &Lifecycle<Self::Data, Self::Optimizer, Self::Scheduler>;

    fn lifecycle_mut(&mut self) -> &mut Lifecycle<Self::Data, Self::Optimizer, Self::Scheduler>;

    /// One epoch of training. Advances the iteration counter itself.
    fn train_step(&mut self) -> Result<StepLog>;

    fn val_step(&mut self) -> Result<StepLog>;

    /// Save every network (via [`Lifecycle::save_network`]) and then the
    /// training state (via [`Lifecycle::save_training_state`]).
    fn save_everything(&mut self) -> Result<()>;

    /// Restore networks and training state before training. Does nothing
    /// unless a run wires up its own sequence of `load_network` and
    /// `resume_training` calls.
    fn load_everything(&mut self) -> Result<()> {
        Ok(())
    }

    fn test_step(&mut self) -> Result<()> {
        Ok(())
    }

    fn test(&mut self) -> Result<()> {
        self.test_step()
    }

    fn train(&mut self) -> Result<()> {
        while self.lifecycle().should_continue() {
            let epoch = self.lifecycle_mut().begin_epoch();

            let mut train_log = self.train_step()?;
            let lifecycle = self.lifecycle_mut();
            train_log.record_counters(epoch, lifecycle.iter());
            info!(epoch, iter = lifecycle.iter(), log = ?train_log, "Finished training epoch");
            lifecycle.train_log = Some(train_log);

            if self.lifecycle().is_checkpoint_epoch() {
                self.save_everything()?;
            }

            if self.lifecycle().is_validation_epoch() {
                if self.lifecycle().val_loader().is_some() {
                    let mut val_log = self.val_step()?;
                    let lifecycle = self.lifecycle_mut();
                    val_log.record_counters(epoch, lifecycle.iter());
                    info!(epoch, log = ?val_log, "Finished validation");
                    lifecycle.val_log = Some(val_log);
                } else {
                    debug!(epoch, "No validation loader, skipping validation");
                }
            }
        }

        let state = self.lifecycle().state();
        info!(epoch = state.epoch, iter = state.iter, "Training finished");
        Ok(())
    }
}
