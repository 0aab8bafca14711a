//! CLI subcommand handlers.

use crate::regression::RegressionRun;
use runkeeper_core::checkpoint;
use runkeeper_core::{CheckpointDir, Phase, RankPlacement, Run, RunConfig};
use std::fmt::Write as _;
use std::path::Path;

/// Point the run's resume prefix at the newest epoch in its checkpoint
/// directory. Leaves the config untouched when nothing has been saved yet.
pub fn resolve_latest(config: &mut RunConfig) -> anyhow::Result<()> {
    let dir = CheckpointDir::new(&config.path.checkpoint);
    match dir.latest_prefix()? {
        Some(prefix) => {
            tracing::info!(prefix = %prefix.display(), "Resuming from latest checkpoint");
            config.path.resume_state = Some(prefix);
        }
        None => {
            tracing::warn!(
                dir = %dir.root().display(),
                "No saved epochs found, starting fresh"
            );
        }
    }
    Ok(())
}

/// Run the configured phase of the regression model and return a summary.
pub fn run(config: RunConfig, accelerator: bool) -> anyhow::Result<String> {
    let placement = RankPlacement::new(config.global_rank, accelerator);
    let phase = config.phase;
    let mut run = RegressionRun::new(config, placement)?;
    run.load_everything()?;

    let mut summary = String::new();
    match phase {
        Phase::Train => {
            run.train()?;
            let lifecycle = run.lifecycle();
            writeln!(
                summary,
                "Finished at epoch {} (iter {})",
                lifecycle.epoch(),
                lifecycle.iter()
            )?;
            if let Some(optimizer) = lifecycle.optimizers().first() {
                writeln!(
                    summary,
                    "optimizer: {} steps, lr {}",
                    optimizer.steps(),
                    optimizer.lr()
                )?;
            }
            for (name, tensor) in run.network().iter() {
                writeln!(summary, "{name}: {:?}", tensor.data())?;
            }
            if let Some(log) = lifecycle.last_train_log() {
                writeln!(summary, "train: {}", serde_json::to_string(log)?)?;
            }
            if let Some(log) = lifecycle.last_val_log() {
                writeln!(summary, "val:   {}", serde_json::to_string(log)?)?;
            }
        }
        Phase::Val | Phase::Test => {
            run.test()?;
            writeln!(summary, "{phase} results:")?;
            for (name, value) in run.lifecycle().results().iter() {
                if value.numel() == 1 {
                    writeln!(summary, "  {name}: {}", value.data()[0])?;
                } else {
                    writeln!(summary, "  {name}: {} values", value.numel())?;
                }
            }
        }
    }
    Ok(summary.trim_end().to_string())
}

/// Describe every saved epoch in `dir`: its iteration count and networks.
pub fn list_checkpoints(dir: &Path) -> anyhow::Result<String> {
    let checkpoints = CheckpointDir::new(dir);
    let epochs = checkpoints.saved_epochs()?;
    let mut out = String::new();
    if epochs.is_empty() {
        writeln!(out, "No checkpoints in {}", dir.display())?;
        return Ok(out);
    }

    for epoch in epochs {
        let record = checkpoint::read_training_state(&checkpoint::state_file(dir, epoch))?;
        let labels = checkpoints.network_labels(epoch)?;
        let iter = record
            .map(|r| r.iter.to_string())
            .unwrap_or_else(|| "?".to_string());
        writeln!(
            out,
            "epoch {epoch:>5}  iter {iter:>8}  networks: {}",
            if labels.is_empty() {
                "-".to_string()
            } else {
                labels.join(", ")
            }
        )?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regression::{NETWORK_LABEL, RegressionRun};
    use pretty_assertions::assert_eq;
    use runkeeper_core::{CpuPlacement, Network};
    use tempfile::TempDir;

    fn config(dir: &Path, n_epoch: u64) -> RunConfig {
        let mut config = RunConfig::default();
        config.train.n_epoch = n_epoch;
        config.train.save_checkpoint_epoch = 1;
        config.train.val_epoch = 1;
        config.path.checkpoint = dir.join("ckpt");
        config
    }

    fn trained(config: RunConfig) -> RegressionRun {
        let mut run = RegressionRun::new(config, CpuPlacement).unwrap();
        run.load_everything().unwrap();
        run.train().unwrap();
        run
    }

    #[test]
    fn test_regression_run_learns() {
        let dir = TempDir::new().unwrap();
        let short = trained(config(dir.path(), 1));
        let long = trained(config(&dir.path().join("long"), 40));

        let first = short.lifecycle().last_train_log().unwrap().get("loss").unwrap();
        let last = long.lifecycle().last_train_log().unwrap().get("loss").unwrap();
        assert!(last < first, "loss did not decrease: {first} -> {last}");

        let val = long.lifecycle().last_val_log().unwrap();
        assert!(val.get("mse").unwrap() < 1e-2);
        assert_eq!(val.get("epoch"), Some(41.0));
    }

    #[test]
    fn test_resumed_run_matches_uninterrupted_run() {
        let dir = TempDir::new().unwrap();
        let full = trained(config(dir.path(), 4));

        let mut cfg = config(&dir.path().join("resumed"), 4);
        cfg.path.resume_state = Some(dir.path().join("ckpt").join("2"));
        let resumed = trained(cfg);

        assert_eq!(resumed.lifecycle().state(), full.lifecycle().state());
        let expected = full.network().state_dict();
        let actual = resumed.network().state_dict();
        for (key, tensor) in &expected {
            assert!(tensor.bit_eq(&actual[key]), "{key} diverged after resume");
        }
        assert_eq!(
            resumed.lifecycle().optimizers()[0],
            full.lifecycle().optimizers()[0]
        );
    }

    #[test]
    fn test_resolve_latest_picks_newest_epoch() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path(), 3);
        resolve_latest(&mut cfg).unwrap();
        assert_eq!(cfg.path.resume_state, None);

        trained(cfg.clone());
        resolve_latest(&mut cfg).unwrap();
        assert_eq!(
            cfg.path.resume_state,
            Some(dir.path().join("ckpt").join("4"))
        );
    }

    #[test]
    fn test_list_checkpoints() {
        let dir = TempDir::new().unwrap();
        let ckpt = dir.path().join("ckpt");
        assert!(list_checkpoints(&ckpt).unwrap().starts_with("No checkpoints"));

        trained(config(dir.path(), 2));
        let listing = list_checkpoints(&ckpt).unwrap();
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("epoch     1"));
        assert!(lines[2].contains("epoch     3"));
        assert!(lines[2].contains(&format!("networks: {NETWORK_LABEL}")));
    }

    #[test]
    fn test_test_phase_reports_metrics() {
        let dir = TempDir::new().unwrap();
        trained(config(dir.path(), 5));

        let mut cfg = config(dir.path(), 5);
        cfg.phase = Phase::Test;
        cfg.path.resume_state = Some(dir.path().join("ckpt").join("5"));
        let summary = run(cfg, false).unwrap();
        assert!(summary.starts_with("test results:"));
        assert!(summary.contains("mse:"));
        assert!(summary.contains("predictions: 64 values"));
    }
}
