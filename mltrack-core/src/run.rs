//! Runs, experiments and model versions as seen by the tracking store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tag MLflow uses to store a run's display name.
pub const RUN_NAME_TAG: &str = "mlflow.runName";

/// Display name used when a run carries no name.
pub const UNKNOWN_RUN_NAME: &str = "Unknown";

/// Opaque run identifier. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for console output.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded execution of a training job.
///
/// Owned by the tracking store; mltrack only reads runs and appends metrics
/// or artifacts to them. The identifier cannot be changed after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    id: RunId,
    pub experiment_id: String,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub artifact_uri: Option<String>,
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    pub tags: BTreeMap<String, String>,
}

impl Run {
    pub fn new(id: impl Into<RunId>) -> Self {
        Self {
            id: id.into(),
            experiment_id: String::new(),
            status: RunStatus::Finished,
            start_time: None,
            artifact_uri: None,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    /// Display name from the `mlflow.runName` tag. Blank names count as absent.
    pub fn name(&self) -> Option<&str> {
        self.tags
            .get(RUN_NAME_TAG)
            .map(String::as_str)
            .filter(|n| !n.trim().is_empty())
    }

    /// Display name, or `"Unknown"` when the run has none.
    pub fn display_name(&self) -> &str {
        self.name().unwrap_or(UNKNOWN_RUN_NAME)
    }

    /// Latest value of a metric, if it was logged.
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn with_experiment(mut self, experiment_id: impl Into<String>) -> Self {
        self.experiment_id = experiment_id.into();
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.tags.insert(RUN_NAME_TAG.to_string(), name.into());
        self
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn with_artifact_uri(mut self, uri: impl Into<String>) -> Self {
        self.artifact_uri = Some(uri.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}

/// A named collection of runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub artifact_location: Option<String>,
    pub lifecycle_stage: Option<String>,
}

/// A version assigned by the model registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: u64,
    pub source: String,
    pub run_id: Option<RunId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_short() {
        assert_eq!(RunId::new("0123456789abcdef").short(), "01234567");
        assert_eq!(RunId::new("abc").short(), "abc");
    }

    #[test]
    fn test_run_display_name_falls_back() {
        let named = Run::new("r1").with_name("train_lr0.01");
        assert_eq!(named.display_name(), "train_lr0.01");
        assert_eq!(Run::new("r2").display_name(), "Unknown");
        let blank = Run::new("r3").with_name("  ");
        assert_eq!(blank.name(), None);
        assert_eq!(blank.display_name(), "Unknown");
    }

    #[test]
    fn test_run_status_serde() {
        let json = serde_json::to_string(&RunStatus::Finished).unwrap();
        assert_eq!(json, "\"FINISHED\"");
        let parsed: RunStatus = serde_json::from_str("\"KILLED\"").unwrap();
        assert_eq!(parsed, RunStatus::Killed);
    }

    #[test]
    fn test_run_builders() {
        let run = Run::new("r1")
            .with_status(RunStatus::Failed)
            .with_param("imgsz", "320")
            .with_metric("mAP50", 0.5);
        assert_eq!(run.id().as_str(), "r1");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.param("imgsz"), Some("320"));
        assert_eq!(run.metric("mAP50"), Some(0.5));
        assert_eq!(run.metric("recall"), None);
    }
}
