//! Reference run: a two-feature linear regression trained with momentum SGD
//! and a step learning-rate schedule on synthetic data.
//!
//! Small enough to finish in milliseconds while exercising every lifecycle
//! operation: per-epoch checkpoints, validation, weight loading, and resume.

use runkeeper_core::{
    Checkpointable, DevicePlacement, Lifecycle, Metric, ParameterSet, Phase, Result, Run,
    RunConfig, RunError, StateDict, StateSnapshot, StepLog, Tensor,
};
use serde_json::json;

pub const NETWORK_LABEL: &str = "Linear";

const TRUE_WEIGHT: [f32; 2] = [2.0, -3.0];
const TRUE_BIAS: f32 = 0.5;

/// One (features, target) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub x: [f32; 2],
    pub y: f32,
}

/// Deterministic in-memory data loader.
#[derive(Debug, Clone)]
pub struct SyntheticLoader {
    samples: Vec<Sample>,
    batch_size: usize,
}

impl SyntheticLoader {
    /// `len` samples of `y = 2*x0 - 3*x1 + 0.5`, features spread over [-0.5, 0.5).
    pub fn new(len: usize, offset: usize, batch_size: usize) -> Self {
        let samples = (offset..offset + len)
            .map(|i| {
                let x = [
                    ((i * 7) % 13) as f32 / 13.0 - 0.5,
                    ((i * 5) % 11) as f32 / 11.0 - 0.5,
                ];
                let y = TRUE_WEIGHT[0] * x[0] + TRUE_WEIGHT[1] * x[1] + TRUE_BIAS;
                Sample { x, y }
            })
            .collect();
        Self {
            samples,
            batch_size: batch_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn batches(&self) -> impl Iterator<Item = &[Sample]> {
        self.samples.chunks(self.batch_size)
    }
}

/// Stochastic gradient descent with classical momentum.
#[derive(Debug, Clone, PartialEq)]
pub struct Sgd {
    lr: f64,
    momentum: f64,
    steps: u64,
    velocity: StateDict,
}

impl Sgd {
    pub fn new(lr: f64, momentum: f64) -> Self {
        Self {
            lr,
            momentum,
            steps: 0,
            velocity: StateDict::new(),
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn step(&mut self, params: &mut ParameterSet, grads: &StateDict) {
        let lr = self.lr as f32;
        let momentum = self.momentum as f32;
        for (name, grad) in grads {
            let Some(param) = params.get_mut(name) else {
                continue;
            };
            let velocity = self
                .velocity
                .entry(name.clone())
                .or_insert_with(|| Tensor::zeros(grad.shape().to_vec()));
            for ((v, g), p) in velocity
                .data_mut()
                .iter_mut()
                .zip(grad.data())
                .zip(param.data_mut().iter_mut())
            {
                *v = momentum * *v + g;
                *p -= lr * *v;
            }
        }
        self.steps += 1;
    }
}

impl Checkpointable for Sgd {
    fn state_dict(&self) -> StateSnapshot {
        StateSnapshot {
            scalars: json!({
                "lr": self.lr,
                "momentum": self.momentum,
                "steps": self.steps,
            }),
            tensors: self.velocity.clone(),
        }
    }

    fn load_state_dict(&mut self, state: StateSnapshot) -> Result<()> {
        let scalars = &state.scalars;
        self.lr = scalars["lr"]
            .as_f64()
            .ok_or_else(|| RunError::invalid_snapshot("sgd: missing 'lr'"))?;
        self.momentum = scalars["momentum"]
            .as_f64()
            .ok_or_else(|| RunError::invalid_snapshot("sgd: missing 'momentum'"))?;
        self.steps = scalars["steps"]
            .as_u64()
            .ok_or_else(|| RunError::invalid_snapshot("sgd: missing 'steps'"))?;
        self.velocity = state.tensors;
        Ok(())
    }
}

/// Decays the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLr {
    base_lr: f64,
    step_size: u64,
    gamma: f64,
    last_epoch: u64,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: u64, gamma: f64) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            last_epoch: 0,
        }
    }

    pub fn step(&mut self, optimizer: &mut Sgd) {
        self.last_epoch += 1;
        let decays = (self.last_epoch / self.step_size) as i32;
        optimizer.set_lr(self.base_lr * self.gamma.powi(decays));
    }
}

impl Checkpointable for StepLr {
    fn state_dict(&self) -> StateSnapshot {
        StateSnapshot::new(json!({
            "base_lr": self.base_lr,
            "step_size": self.step_size,
            "gamma": self.gamma,
            "last_epoch": self.last_epoch,
        }))
    }

    fn load_state_dict(&mut self, state: StateSnapshot) -> Result<()> {
        let field = |name: &str| {
            state.scalars[name]
                .as_f64()
                .ok_or_else(|| RunError::invalid_snapshot(format!("step_lr: missing '{name}'")))
        };
        self.base_lr = field("base_lr")?;
        self.gamma = field("gamma")?;
        self.step_size = state.scalars["step_size"]
            .as_u64()
            .ok_or_else(|| RunError::invalid_snapshot("step_lr: missing 'step_size'"))?;
        self.last_epoch = state.scalars["last_epoch"]
            .as_u64()
            .ok_or_else(|| RunError::invalid_snapshot("step_lr: missing 'last_epoch'"))?;
        Ok(())
    }
}

/// Mean squared error.
pub struct Mse;

impl Metric for Mse {
    fn name(&self) -> &str {
        "mse"
    }

    fn compute(&self, output: &[f32], target: &[f32]) -> f64 {
        mean(output.iter().zip(target).map(|(o, t)| {
            let d = (*o - *t) as f64;
            d * d
        }))
    }
}

/// Mean absolute error.
pub struct Mae;

impl Metric for Mae {
    fn name(&self) -> &str {
        "mae"
    }

    fn compute(&self, output: &[f32], target: &[f32]) -> f64 {
        mean(output.iter().zip(target).map(|(o, t)| ((*o - *t) as f64).abs()))
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

pub struct RegressionRun {
    lifecycle: Lifecycle<SyntheticLoader, Sgd, StepLr>,
    net: ParameterSet,
}

impl RegressionRun {
    pub fn new(config: RunConfig, placement: impl DevicePlacement + 'static) -> Result<Self> {
        let batch_size = config.batch_size()?;
        let phase_loader = match config.phase {
            Phase::Train => SyntheticLoader::new(256, 0, batch_size),
            Phase::Val | Phase::Test => SyntheticLoader::new(64, 10_000, batch_size),
        };

        let base_lr = 0.05;
        let mut builder = Lifecycle::builder(config.clone(), phase_loader)
            .optimizer(Sgd::new(base_lr, 0.9))
            .scheduler(StepLr::new(base_lr, 20, 0.5))
            .metric(Mse)
            .metric(Mae)
            .placement(placement);
        if config.phase == Phase::Train {
            let val_batch = config
                .datasets
                .get(Phase::Val.as_str())
                .map(|d| d.dataloader.args.batch_size)
                .unwrap_or(batch_size);
            builder = builder.val_loader(SyntheticLoader::new(64, 10_000, val_batch));
        }

        Ok(Self {
            lifecycle: builder.build()?,
            net: ParameterSet::new()
                .with("weight", Tensor::zeros(vec![2]))
                .with("bias", Tensor::zeros(vec![1])),
        })
    }

    pub fn network(&self) -> &ParameterSet {
        &self.net
    }

    fn predict(&self, x: &[f32; 2]) -> f32 {
        let w = self.net.get("weight").map(|t| t.data()).unwrap_or(&[0.0, 0.0]);
        let b = self.net.get("bias").map(|t| t.data()[0]).unwrap_or(0.0);
        w[0] * x[0] + w[1] * x[1] + b
    }

    fn evaluate(&self, loader: &SyntheticLoader) -> StepLog {
        let mut outputs = Vec::with_capacity(loader.len());
        let mut targets = Vec::with_capacity(loader.len());
        for batch in loader.batches() {
            for sample in batch {
                outputs.push(self.predict(&sample.x));
                targets.push(sample.y);
            }
        }
        self.lifecycle
            .metrics()
            .iter()
            .map(|m| (m.name().to_string(), m.compute(&outputs, &targets)))
            .collect()
    }
}

impl Run for RegressionRun {
    type Data = SyntheticLoader;
    type Optimizer = Sgd;
    type Scheduler = StepLr;

    fn lifecycle(&self) -> &Lifecycle<SyntheticLoader, Sgd, StepLr> {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle<SyntheticLoader, Sgd, StepLr> {
        &mut self.lifecycle
    }

    fn train_step(&mut self) -> Result<StepLog> {
        let batches: Vec<Vec<Sample>> = self
            .lifecycle
            .phase_loader()
            .batches()
            .map(<[Sample]>::to_vec)
            .collect();

        let mut total_loss = 0.0;
        for batch in &batches {
            let n = batch.len() as f32;
            let mut grad_w = [0.0f32; 2];
            let mut grad_b = 0.0f32;
            for sample in batch {
                let err = self.predict(&sample.x) - sample.y;
                total_loss += (err * err) as f64;
                grad_w[0] += 2.0 * err * sample.x[0] / n;
                grad_w[1] += 2.0 * err * sample.x[1] / n;
                grad_b += 2.0 * err / n;
            }

            let mut grads = StateDict::new();
            grads.insert("weight".into(), Tensor::new(vec![2], grad_w.to_vec())?);
            grads.insert("bias".into(), Tensor::new(vec![1], vec![grad_b])?);
            self.lifecycle.optimizers_mut()[0].step(&mut self.net, &grads);
            self.lifecycle.advance_iter(1);
        }

        let (optimizers, schedulers) = self.lifecycle.optimizers_and_schedulers_mut();
        schedulers[0].step(&mut optimizers[0]);

        let samples = batches.iter().map(Vec::len).sum::<usize>().max(1);
        Ok(StepLog::new()
            .with("loss", total_loss / samples as f64)
            .with("lr", self.lifecycle.optimizers()[0].lr()))
    }

    fn val_step(&mut self) -> Result<StepLog> {
        let Some(loader) = self.lifecycle.val_loader() else {
            return Ok(StepLog::new());
        };
        Ok(self.evaluate(loader))
    }

    fn save_everything(&mut self) -> Result<()> {
        self.lifecycle.save_network(&self.net, NETWORK_LABEL)?;
        self.lifecycle.save_training_state()
    }

    fn load_everything(&mut self) -> Result<()> {
        self.lifecycle.load_network(&mut self.net, NETWORK_LABEL, true)?;
        self.lifecycle.resume_training()?;
        Ok(())
    }

    fn test_step(&mut self) -> Result<()> {
        let log = self.evaluate(self.lifecycle.phase_loader());
        let mut predictions = Vec::new();
        for batch in self.lifecycle.phase_loader().batches() {
            predictions.extend(batch.iter().map(|s| self.predict(&s.x)));
        }
        let count = predictions.len();
        let predictions = Tensor::new(vec![count], predictions)?;
        let results = self.lifecycle.results_mut();
        results.clear();
        results.push("predictions", predictions);
        for (name, value) in log.iter() {
            results.push(name.clone(), Tensor::scalar(*value as f32));
        }
        tracing::info!(log = ?log, "Evaluated {count} samples");
        Ok(())
    }
}
