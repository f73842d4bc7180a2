//! mltrack CLI: inspect MLflow experiments, backfill metrics from local
//! training output and publish the best model.

mod commands;
mod render;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// mltrack: experiment tracking companion for YOLO training runs
#[derive(Parser, Debug)]
#[command(name = "mltrack", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Workspace directory (holds `runs/`, `reports/` and `.mltrack/`)
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Tracking server URI (overrides MLFLOW_TRACKING_URI)
    #[arg(long, global = true)]
    tracking_uri: Option<String>,

    /// Experiment name
    #[arg(short, long, global = true)]
    experiment: Option<String>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Summarize the experiment's runs and write a CSV report
    Analyze,
    /// Backfill metrics of finished runs from local results.csv files
    Relog,
    /// Show the best run and how to register it
    Best {
        /// Registered model name
        #[arg(long)]
        model_name: Option<String>,
    },
    /// Upload the best run's weights and register a new model version
    Publish {
        /// Registered model name
        #[arg(long)]
        model_name: Option<String>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration
    Show,
}

/// Flags that take precedence over every configuration source.
#[derive(Debug, Clone, Default)]
pub(crate) struct Overrides {
    pub config_file: Option<PathBuf>,
    pub tracking_uri: Option<String>,
    pub experiment: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "mltrack", "mltrack")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let (json_layer, _guard) = match file_log_writer(&log_dir) {
        Some((writer, guard)) => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    tracing::debug!(workspace = %workspace.display(), command = ?cli.command, "dispatching");

    let overrides = Overrides {
        config_file: cli.config,
        tracking_uri: cli.tracking_uri,
        experiment: cli.experiment,
    };

    commands::handle_command(cli.command, &workspace, &overrides).await
}

/// Daily rolling JSON log file under `log_dir`. `None` when the directory
/// cannot be created; logging then goes to stderr only.
fn file_log_writer(log_dir: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("mltrack.log")
        .build(log_dir)
        .ok()?;
    Some(tracing_appender::non_blocking(appender))
}
