//! Runkeeper CLI: drive a training run with periodic checkpoints and resume.
//!
//! Runs the bundled regression model through the run lifecycle, or inspects a
//! checkpoint directory.

mod commands;
mod regression;

use clap::Parser;
use runkeeper_core::{ConfigOverrides, Phase};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Runkeeper: epoch bookkeeping, checkpoints and resume for training runs
#[derive(Parser, Debug)]
#[command(name = "runkeeper", version, about, long_about = None)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run phase: train, val or test
    #[arg(long)]
    phase: Option<Phase>,

    /// Global rank of this process; only rank 0 writes checkpoints
    #[arg(long)]
    rank: Option<usize>,

    /// Directory checkpoints are written to
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Resume prefix, e.g. `checkpoint/40`
    #[arg(long, conflicts_with = "resume_latest")]
    resume: Option<PathBuf>,

    /// Resume from the newest epoch in the checkpoint directory
    #[arg(long)]
    resume_latest: bool,

    /// Place loaded tensors on the accelerator matching the rank
    #[arg(long)]
    accelerator: bool,

    /// Directory for JSON log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the configured phase (default)
    Run,
    /// List the epochs saved in a checkpoint directory
    Checkpoints {
        /// Directory to inspect; defaults to the configured checkpoint path
        dir: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = cli.log_dir.clone().unwrap_or_else(|| {
        directories::ProjectDirs::from("dev", "runkeeper", "runkeeper")
            .map(|d| d.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("."))
    });
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "runkeeper.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let overrides = ConfigOverrides {
        phase: cli.phase,
        global_rank: cli.rank,
        checkpoint_dir: cli.checkpoint_dir.clone(),
        resume_state: cli.resume.clone(),
    };
    let mut config = runkeeper_core::load_config(cli.config.as_deref(), Some(&overrides))
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            if cli.resume_latest {
                commands::resolve_latest(&mut config)?;
            }
            let summary = commands::run(config, cli.accelerator)?;
            println!("{summary}");
            Ok(())
        }
        Commands::Checkpoints { dir } => {
            let dir = dir.unwrap_or_else(|| config.path.checkpoint.clone());
            print!("{}", commands::list_checkpoints(&dir)?);
            Ok(())
        }
    }
}
