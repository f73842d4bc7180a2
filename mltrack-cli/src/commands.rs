//! CLI subcommand handlers.

use crate::render;
use crate::{Commands, ConfigAction, Overrides};
use anyhow::Context;
use mltrack_core::analysis::analyze_experiment;
use mltrack_core::config::{load_config_with_file, workspace_config_path};
use mltrack_core::publish::{find_best_run, publish_best};
use mltrack_core::relog::{RelogOutcome, relog_experiment};
use mltrack_core::{MetricRecoverer, MlflowClient, MltrackConfig, TrackingError};
use std::path::Path;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    overrides: &Overrides,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace, overrides),
        Commands::Analyze => {
            let config = load(workspace, overrides)?;
            handle_analyze(&config, workspace).await
        }
        Commands::Relog => {
            let config = load(workspace, overrides)?;
            handle_relog(&config, workspace).await
        }
        Commands::Best { model_name } => {
            let mut config = load(workspace, overrides)?;
            if let Some(name) = model_name {
                config.registry.model_name = name;
            }
            handle_best(&config).await
        }
        Commands::Publish { model_name } => {
            let mut config = load(workspace, overrides)?;
            if let Some(name) = model_name {
                config.registry.model_name = name;
            }
            handle_publish(&config, workspace).await
        }
    }
}

/// Load layered configuration and apply CLI overrides.
fn load(workspace: &Path, overrides: &Overrides) -> anyhow::Result<MltrackConfig> {
    let mut config =
        load_config_with_file(Some(workspace), overrides.config_file.as_deref(), None)
            .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    apply_overrides(&mut config, overrides);
    Ok(config)
}

fn apply_overrides(config: &mut MltrackConfig, overrides: &Overrides) {
    if let Some(uri) = &overrides.tracking_uri {
        config.tracking.uri = uri.clone();
    }
    if let Some(name) = &overrides.experiment {
        config.experiment.name = name.clone();
    }
}

fn client(config: &MltrackConfig) -> anyhow::Result<MlflowClient> {
    MlflowClient::new(&config.tracking).context("Failed to create tracking client")
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    overrides: &Overrides,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }

            let toml_str = toml::to_string_pretty(&MltrackConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, overrides)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

async fn handle_analyze(config: &MltrackConfig, workspace: &Path) -> anyhow::Result<()> {
    let store = client(config)?;
    let experiment = &config.experiment.name;
    println!("Analyzing experiment: {}", experiment);
    println!("{}", render::rule());

    let analysis =
        match analyze_experiment(&store, experiment, &config.experiment.primary_metric).await {
            Ok(analysis) => analysis,
            Err(e) => {
                print_lookup_hints(&e, config);
                return Err(e).context("Analysis failed");
            }
        };
    println!("{} run(s) found\n", analysis.run_count());

    println!("Run summary:");
    print!(
        "{}",
        render::format_table(&analysis.summary.headers, &analysis.summary.rows)
    );

    if !analysis.stats.is_empty() {
        println!("\nMetric statistics:");
        print!("{}", render::format_stats(&analysis.stats));
    }

    println!("\nBest run (by {}):", analysis.ranked_by);
    match &analysis.best {
        Some(run) => println!("{}", render::format_run_details(run)),
        None => println!("  No run carries {} yet.", analysis.ranked_by),
    }

    let reports_dir = config.paths.resolve(workspace).reports_dir;
    let report = analysis
        .write_report(&reports_dir)
        .context("Failed to write report")?;
    println!("\nReport saved: {}", report.display());
    println!("\n{}", render::rule());
    println!("Tracking UI: {}", config.tracking.uri);
    Ok(())
}

async fn handle_relog(config: &MltrackConfig, workspace: &Path) -> anyhow::Result<()> {
    let store = client(config)?;
    let experiment = &config.experiment.name;
    let runs_dir = config.paths.resolve(workspace).runs_dir;
    println!("Backfilling metrics for experiment: {}", experiment);
    println!("{}", render::rule());

    let recoverer =
        MetricRecoverer::new(&store).with_divergence_policy(config.recovery.on_divergence);
    let summary = match relog_experiment(&store, &recoverer, experiment, &runs_dir).await {
        Ok(summary) => summary,
        Err(e) => {
            print_lookup_hints(&e, config);
            return Err(e).context("Backfill failed");
        }
    };
    println!("{} finished run(s) found", summary.total());

    let mut partial = 0;
    for (idx, entry) in summary.runs.iter().enumerate() {
        println!(
            "\nRun {}/{}: {}",
            idx + 1,
            summary.total(),
            entry.run.display_name()
        );
        println!("  ID: {}", entry.run.id().short());
        match &entry.outcome {
            RelogOutcome::NoResults => {
                println!("  No results.csv found under {}", runs_dir.display());
            }
            RelogOutcome::Failed {
                results_path,
                error,
            } => {
                println!("  Found: {}", results_path.display());
                println!("  Error: {}", error);
            }
            RelogOutcome::Recovered {
                results_path,
                report,
            } => {
                println!("  Found: {}", results_path.display());
                for warning in &report.warnings {
                    println!("  Warning: {}", warning);
                }
                if !report.logged.is_empty() {
                    println!(
                        "  Logged at step {}: {}",
                        report.step,
                        report.logged.join(", ")
                    );
                }
                if !report.unchanged.is_empty() {
                    println!("  Already up to date: {}", report.unchanged.join(", "));
                }
                for d in &report.diverged {
                    println!(
                        "  {} differs: stored {:.4}, recovered {:.4} ({})",
                        d.metric, d.stored, d.recovered, config.recovery.on_divergence
                    );
                }
                if let Some(value) = report.recovered.get("mAP50") {
                    println!("  mAP@50: {:.4}", value);
                }
                if let Some(err) = report.partial_failure() {
                    partial += 1;
                    println!("  Warning: {}", err);
                    for (metric, reason) in &report.failed {
                        println!("    {}: {}", metric, reason);
                    }
                }
            }
        }
    }

    println!("\n{}", render::rule());
    println!(
        "Done: {}/{} run(s) updated",
        summary.updated(),
        summary.total()
    );
    println!("Tracking UI: {}", config.tracking.uri);
    println!("Next: mltrack analyze");

    if partial > 0 {
        anyhow::bail!("{} run(s) had metric writes that failed", partial);
    }
    Ok(())
}

async fn handle_best(config: &MltrackConfig) -> anyhow::Result<()> {
    let store = client(config)?;
    let experiment = &config.experiment.name;
    let metric = &config.experiment.primary_metric;
    println!("Looking for the best run in '{}'...", experiment);

    let best = match find_best_run(&store, experiment, metric).await {
        Ok(best) => best,
        Err(e) => {
            print_lookup_hints(&e, config);
            return Err(e).context("Best run lookup failed");
        }
    };

    println!("\nBest run:");
    println!("{}", render::format_run_details(&best.run));
    if let Some(uri) = &best.run.artifact_uri {
        println!("\nArtifacts URI: {}", uri);
    }

    println!("\n{}", render::rule());
    println!("Manual registration:");
    println!("{}", render::rule());
    println!("1. Open the tracking UI: {}", config.tracking.uri);
    println!("2. Go to experiment '{}'", experiment);
    println!("3. Open run {}", best.run.id().short());
    println!("4. In 'Artifacts', select 'weights/best.pt'");
    println!("5. Click 'Register Model'");
    println!("6. Model name: {}", config.registry.model_name);
    println!("7. Pick the stage: 'Staging' or 'Production'");
    println!("\nOr let mltrack do it: mltrack publish");
    Ok(())
}

async fn handle_publish(config: &MltrackConfig, workspace: &Path) -> anyhow::Result<()> {
    let store = client(config)?;
    let experiment = &config.experiment.name;
    let metric = &config.experiment.primary_metric;
    let model_name = &config.registry.model_name;
    let runs_dir = config.paths.resolve(workspace).runs_dir;
    println!("Publishing the best run of '{}'...", experiment);
    println!("{}", render::rule());

    let report = match publish_best(&store, experiment, metric, model_name, &runs_dir).await {
        Ok(report) => report,
        Err(e) => {
            print_lookup_hints(&e, config);
            println!("\nManual fallback:");
            println!("  1. Open: {}", config.tracking.uri);
            println!("  2. Open the best run of '{}'", experiment);
            println!("  3. Artifacts -> weights/best.pt -> Register Model");
            println!("  4. Name: {}, Stage: Staging", model_name);
            return Err(e).context("Publish failed");
        }
    };

    let run = &report.best.run;
    println!("Best run: {} ({})", run.display_name(), run.id().short());
    if let Some(value) = report.best.metric_value() {
        println!("  {}: {:.4}", metric, value);
    }
    println!(
        "Weights: {} ({})",
        report.weights_path.display(),
        render::format_megabytes(report.weights_bytes)
    );
    println!("Uploaded:");
    for path in &report.uploaded {
        println!("  {}", path);
    }

    println!("\n{}", render::rule());
    println!("Registered {} version {}", model_name, report.version.version);
    println!("{}", render::rule());
    println!("Source: {}", report.model_uri);
    println!(
        "Tracking UI: {}",
        render::model_ui_url(&config.tracking.uri, model_name)
    );
    println!("\nNext steps:");
    println!("  1. Transition the version to 'Staging'");
    println!("  2. Add a description");
    Ok(())
}

/// Explain the usual causes of a failed experiment lookup.
fn print_lookup_hints(error: &TrackingError, config: &MltrackConfig) {
    match error {
        TrackingError::NotFound {
            kind: "experiment",
            name,
        } => {
            println!("Experiment '{}' not found.", name);
            println!("Make sure that:");
            println!(
                "  1. The tracking server is running at {}",
                config.tracking.uri
            );
            println!("  2. Training runs have been logged to it");
        }
        TrackingError::NoRuns { experiment } => {
            println!("No matching runs in experiment '{}'.", experiment);
        }
        TrackingError::Network { uri, .. } => {
            println!("Cannot reach the tracking server at {}.", uri);
            println!("Start it or point MLFLOW_TRACKING_URI / --tracking-uri at it.");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();

        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, workspace, &Overrides::default())
            .await
            .unwrap();

        let config_path = workspace.join(".mltrack").join("config.toml");
        let content = std::fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("[tracking]"));
        assert!(content.contains("cv_yolo_tiny"));
    }

    #[tokio::test]
    async fn test_config_init_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();
        let config_path = workspace.join(".mltrack").join("config.toml");
        std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        std::fs::write(&config_path, "[experiment]\nname = \"mine\"\n").unwrap();

        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, workspace, &Overrides::default())
            .await
            .unwrap();

        let content = std::fs::read_to_string(&config_path).unwrap();
        assert_eq!(content, "[experiment]\nname = \"mine\"\n");
    }

    #[tokio::test]
    async fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        let command = Commands::Config {
            action: ConfigAction::Show,
        };
        let result = handle_command(command, dir.path(), &Overrides::default()).await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_overrides_win_over_config() {
        let dir = TempDir::new().unwrap();
        let overrides = Overrides {
            config_file: None,
            tracking_uri: Some("http://mlflow.test:5000".into()),
            experiment: Some("cv_yolo_small".into()),
        };
        let config = load(dir.path(), &overrides).unwrap();
        assert_eq!(config.tracking.uri, "http://mlflow.test:5000");
        assert_eq!(config.experiment.name, "cv_yolo_small");
        assert_eq!(config.registry.model_name, "yolo_person_detector");
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let overrides = Overrides {
            config_file: Some(dir.path().join("missing.toml")),
            ..Default::default()
        };
        assert!(load(dir.path(), &overrides).is_err());
    }
}
