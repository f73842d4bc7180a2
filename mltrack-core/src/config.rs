//! Configuration system for mltrack.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/mltrack/config.toml` and/or `.mltrack/config.toml`
//! in the workspace directory. `MLFLOW_TRACKING_URI` is honored for the server address.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that selects the tracking server address.
pub const TRACKING_URI_ENV: &str = "MLFLOW_TRACKING_URI";

/// Top-level configuration for mltrack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MltrackConfig {
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Tracking server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Base URL of the MLflow-compatible tracking server.
    #[serde(default = "default_tracking_uri")]
    pub uri: String,
    /// Per-request timeout in seconds. No timeout when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            uri: default_tracking_uri(),
            timeout_secs: None,
        }
    }
}

fn default_tracking_uri() -> String {
    "http://localhost:5000".to_string()
}

/// Which experiment to inspect and how runs are ranked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Experiment name as registered in the tracking store.
    #[serde(default = "default_experiment_name")]
    pub name: String,
    /// Metric maximized when choosing the best run.
    #[serde(default = "default_primary_metric")]
    pub primary_metric: String,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: default_experiment_name(),
            primary_metric: default_primary_metric(),
        }
    }
}

fn default_experiment_name() -> String {
    "cv_yolo_tiny".to_string()
}

fn default_primary_metric() -> String {
    "mAP50".to_string()
}

/// Model registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registered model name that published versions are attached to.
    #[serde(default = "default_model_name")]
    pub model_name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
        }
    }
}

fn default_model_name() -> String {
    "yolo_person_detector".to_string()
}

/// Local directories, relative to the workspace unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding one sub-directory per training run.
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    /// Directory where CSV reports are written.
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            reports_dir: default_reports_dir(),
        }
    }
}

impl PathsConfig {
    /// Resolve both directories against `workspace`.
    pub fn resolve(&self, workspace: &Path) -> PathsConfig {
        PathsConfig {
            runs_dir: workspace.join(&self.runs_dir),
            reports_dir: workspace.join(&self.reports_dir),
        }
    }
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("reports")
}

/// What to do when a recovered metric differs from the value already stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergencePolicy {
    /// Log the recovered value at the final epoch so it becomes the latest value.
    #[default]
    Overwrite,
    /// Leave the stored value untouched.
    Keep,
}

impl std::fmt::Display for DivergencePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DivergencePolicy::Overwrite => write!(f, "overwrite"),
            DivergencePolicy::Keep => write!(f, "keep"),
        }
    }
}

/// Metric backfill settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default)]
    pub on_divergence: DivergencePolicy,
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. `MLFLOW_TRACKING_URI`
/// 3. Environment variables (prefixed with `MLTRACK_`, `__` for nesting)
/// 4. Workspace-local config (`.mltrack/config.toml`)
/// 5. User config (`~/.config/mltrack/config.toml`)
/// 6. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&MltrackConfig>,
) -> Result<MltrackConfig, Box<figment::Error>> {
    load_config_with_file(workspace, None, overrides)
}

/// Like [`load_config`], with an explicit config file layered above the
/// workspace config. A missing explicit file is an error.
pub fn load_config_with_file(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
    overrides: Option<&MltrackConfig>,
) -> Result<MltrackConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(MltrackConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(file) = config_file {
        if !file.is_file() {
            return Err(Box::new(figment::Error::from(format!(
                "config file not found: {}",
                file.display()
            ))));
        }
        figment = figment.merge(Toml::file(file));
    }

    // MLTRACK_TRACKING__URI, MLTRACK_EXPERIMENT__NAME, etc.
    figment = figment.merge(Env::prefixed("MLTRACK_").split("__"));
    figment = figment.merge(
        Env::raw()
            .only(&[TRACKING_URI_ENV])
            .map(|_| "tracking.uri".into()),
    );

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Path of the user-level config file, if a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "mltrack", "mltrack")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".mltrack").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MltrackConfig::default();
        assert_eq!(config.tracking.uri, "http://localhost:5000");
        assert!(config.tracking.timeout_secs.is_none());
        assert_eq!(config.experiment.name, "cv_yolo_tiny");
        assert_eq!(config.experiment.primary_metric, "mAP50");
        assert_eq!(config.registry.model_name, "yolo_person_detector");
        assert_eq!(config.paths.runs_dir, PathBuf::from("runs"));
        assert_eq!(config.recovery.on_divergence, DivergencePolicy::Overwrite);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let mut config = MltrackConfig::default();
        config.recovery.on_divergence = DivergencePolicy::Keep;
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("on_divergence = \"keep\""));
        let parsed: MltrackConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.recovery.on_divergence, DivergencePolicy::Keep);
        assert_eq!(parsed.experiment.name, config.experiment.name);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: MltrackConfig = toml::from_str("[experiment]\nname = \"other\"\n").unwrap();
        assert_eq!(parsed.experiment.name, "other");
        assert_eq!(parsed.experiment.primary_metric, "mAP50");
        assert_eq!(parsed.registry.model_name, "yolo_person_detector");
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = MltrackConfig::default();
        overrides.tracking.uri = "http://tracking.internal:8080".to_string();
        overrides.registry.model_name = "detector".to_string();

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.tracking.uri, "http://tracking.internal:8080");
        assert_eq!(config.registry.model_name, "detector");
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(".mltrack");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            r#"
[experiment]
name = "cv_yolo_small"

[paths]
runs_dir = "outputs/runs"

[recovery]
on_divergence = "keep"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.experiment.name, "cv_yolo_small");
        assert_eq!(config.paths.runs_dir, PathBuf::from("outputs/runs"));
        assert_eq!(config.paths.reports_dir, PathBuf::from("reports"));
        assert_eq!(config.recovery.on_divergence, DivergencePolicy::Keep);
    }

    #[test]
    fn test_explicit_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(&file, "[registry]\nmodel_name = \"custom_detector\"\n").unwrap();

        let config = load_config_with_file(None, Some(&file), None).unwrap();
        assert_eq!(config.registry.model_name, "custom_detector");

        let missing = dir.path().join("missing.toml");
        assert!(load_config_with_file(None, Some(&missing), None).is_err());
    }

    #[test]
    fn test_paths_resolve_against_workspace() {
        let paths = PathsConfig::default().resolve(Path::new("/work"));
        assert_eq!(paths.runs_dir, PathBuf::from("/work/runs"));
        assert_eq!(paths.reports_dir, PathBuf::from("/work/reports"));
    }
}
