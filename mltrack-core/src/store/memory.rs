//! In-process tracking store.

use super::{RunQuery, TrackingStore};
use crate::error::{TrackingError, TrackingResult};
use crate::run::{Experiment, ModelVersion, Run, RunId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A metric write recorded by [`InMemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedMetric {
    pub run_id: RunId,
    pub key: String,
    pub value: f64,
    pub step: i64,
}

/// An artifact upload recorded by [`InMemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub run_id: RunId,
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Default)]
struct State {
    experiments: Vec<Experiment>,
    runs: Vec<Run>,
    metric_log: Vec<LoggedMetric>,
    latest_steps: HashMap<(RunId, String), i64>,
    artifacts: Vec<StoredArtifact>,
    models: BTreeMap<String, Vec<ModelVersion>>,
    failing_metrics: HashSet<String>,
}

/// Tracking store kept entirely in memory.
///
/// Runs are returned in insertion order unless the query asks for an
/// ordering. A logged value becomes the run's latest only when its step is
/// not below the step of the value it replaces; metrics seeded through
/// [`InMemoryStore::insert_run`] count as step 0. Metric writes can be made
/// to fail per key to exercise partial-failure handling.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create an experiment and return it. Ids are assigned sequentially from "1".
    pub fn add_experiment(&self, name: &str) -> Experiment {
        let mut state = self.state();
        let id = (state.experiments.len() + 1).to_string();
        let experiment = Experiment {
            id: id.clone(),
            name: name.to_string(),
            artifact_location: Some(format!("mlflow-artifacts:/{id}")),
            lifecycle_stage: Some("active".to_string()),
        };
        state.experiments.push(experiment.clone());
        experiment
    }

    /// Insert or replace a run.
    pub fn insert_run(&self, run: Run) {
        let mut state = self.state();
        match state.runs.iter_mut().find(|r| r.id() == run.id()) {
            Some(existing) => *existing = run,
            None => state.runs.push(run),
        }
    }

    /// Make every future `log_metric` call for `key` fail.
    pub fn fail_metric(&self, key: &str) {
        self.state().failing_metrics.insert(key.to_string());
    }

    /// Every successful metric write, in call order.
    pub fn metric_log(&self) -> Vec<LoggedMetric> {
        self.state().metric_log.clone()
    }

    pub fn artifacts(&self) -> Vec<StoredArtifact> {
        self.state().artifacts.clone()
    }

    pub fn model_versions(&self, name: &str) -> Vec<ModelVersion> {
        self.state().models.get(name).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl TrackingStore for InMemoryStore {
    async fn experiment_by_name(&self, name: &str) -> TrackingResult<Option<Experiment>> {
        Ok(self
            .state()
            .experiments
            .iter()
            .find(|e| e.name == name)
            .cloned())
    }

    async fn search_runs(&self, query: &RunQuery) -> TrackingResult<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .state()
            .runs
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        runs.sort_by(|a, b| query.compare(a, b));
        if let Some(max) = query.max_results {
            runs.truncate(max);
        }
        Ok(runs)
    }

    async fn get_run(&self, run_id: &RunId) -> TrackingResult<Run> {
        self.state()
            .runs
            .iter()
            .find(|r| r.id() == run_id)
            .cloned()
            .ok_or_else(|| TrackingError::not_found("run", run_id.as_str()))
    }

    async fn log_metric(
        &self,
        run_id: &RunId,
        key: &str,
        value: f64,
        step: i64,
    ) -> TrackingResult<()> {
        let mut state = self.state();
        if state.failing_metrics.contains(key) {
            return Err(TrackingError::Api {
                status: 500,
                code: Some("INTERNAL_ERROR".to_string()),
                message: format!("metric '{key}' rejected"),
            });
        }
        let state = &mut *state;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id() == run_id)
            .ok_or_else(|| TrackingError::not_found("run", run_id.as_str()))?;
        let latest = state
            .latest_steps
            .entry((run_id.clone(), key.to_string()))
            .or_insert(0);
        if step >= *latest {
            *latest = step;
            run.metrics.insert(key.to_string(), value);
        }
        state.metric_log.push(LoggedMetric {
            run_id: run_id.clone(),
            key: key.to_string(),
            value,
            step,
        });
        Ok(())
    }

    async fn log_artifact(
        &self,
        run: &Run,
        local_path: &Path,
        artifact_dir: &str,
    ) -> TrackingResult<String> {
        let size_bytes = match tokio::fs::metadata(local_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TrackingError::not_found(
                    "artifact file",
                    local_path.display().to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = format!("{}/{}", artifact_dir.trim_matches('/'), file_name);
        self.state().artifacts.push(StoredArtifact {
            run_id: run.id().clone(),
            path: path.clone(),
            size_bytes,
        });
        Ok(path)
    }

    async fn register_model(
        &self,
        name: &str,
        source: &str,
        run_id: &RunId,
    ) -> TrackingResult<ModelVersion> {
        let mut state = self.state();
        let versions = state.models.entry(name.to_string()).or_default();
        let version = ModelVersion {
            name: name.to_string(),
            version: versions.len() as u64 + 1,
            source: source.to_string(),
            run_id: Some(run_id.clone()),
        };
        versions.push(version.clone());
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunStatus;
    use crate::store::{RunFilter, RunOrder};

    fn seeded() -> (InMemoryStore, Experiment) {
        let store = InMemoryStore::new();
        let exp = store.add_experiment("cv_yolo_tiny");
        store.insert_run(Run::new("a").with_experiment(&exp.id).with_metric("mAP50", 0.4));
        store.insert_run(Run::new("b").with_experiment(&exp.id).with_metric("mAP50", 0.8));
        store.insert_run(
            Run::new("c")
                .with_experiment(&exp.id)
                .with_status(RunStatus::Failed)
                .with_metric("mAP50", 0.9),
        );
        (store, exp)
    }

    #[tokio::test]
    async fn test_experiment_lookup() {
        let (store, exp) = seeded();
        assert_eq!(
            store.experiment_by_name("cv_yolo_tiny").await.unwrap(),
            Some(exp)
        );
        assert!(store.experiment_by_name("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_filters_orders_and_limits() {
        let (store, exp) = seeded();
        let query = RunQuery::for_experiment(&exp.id)
            .filter(RunFilter::Status(RunStatus::Finished))
            .order(RunOrder::metric_desc("mAP50"))
            .limit(1);
        let runs = store.search_runs(&query).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id().as_str(), "b");
    }

    #[tokio::test]
    async fn test_log_metric_updates_run() {
        let (store, _) = seeded();
        let id = RunId::new("a");
        store.log_metric(&id, "recall", 0.7, 3).await.unwrap();
        let run = store.get_run(&id).await.unwrap();
        assert_eq!(run.metric("recall"), Some(0.7));
        assert_eq!(store.metric_log().len(), 1);
        assert_eq!(store.metric_log()[0].step, 3);
    }

    #[tokio::test]
    async fn test_lower_step_does_not_replace_latest() {
        let (store, _) = seeded();
        let id = RunId::new("a");
        store.log_metric(&id, "mAP50", 0.5, 49).await.unwrap();
        store.log_metric(&id, "mAP50", 0.9, 0).await.unwrap();
        assert_eq!(store.get_run(&id).await.unwrap().metric("mAP50"), Some(0.5));

        store.log_metric(&id, "mAP50", 0.7, 49).await.unwrap();
        assert_eq!(store.get_run(&id).await.unwrap().metric("mAP50"), Some(0.7));
        assert_eq!(store.metric_log().len(), 3);
    }

    #[tokio::test]
    async fn test_failing_metric_is_rejected() {
        let (store, _) = seeded();
        store.fail_metric("recall");
        let err = store
            .log_metric(&RunId::new("a"), "recall", 0.7, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackingError::Api { status: 500, .. }));
        assert!(store.metric_log().is_empty());
    }

    #[tokio::test]
    async fn test_register_model_increments_versions() {
        let store = InMemoryStore::new();
        let id = RunId::new("a");
        let v1 = store.register_model("det", "src1", &id).await.unwrap();
        let v2 = store.register_model("det", "src2", &id).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(store.model_versions("det").len(), 2);
    }
}
