//! Best-run lookup, artifact upload and model registration.

use crate::error::{TrackingError, TrackingResult};
use crate::run::{Experiment, ModelVersion, Run, RunStatus};
use crate::selection::into_best;
use crate::store::{RunFilter, RunOrder, RunQuery, TrackingStore};
use std::path::{Path, PathBuf};
use tracing::info;

/// Weights file, relative to a run's local directory.
pub const WEIGHTS_FILE: &str = "weights/best.pt";

/// Artifact directory the weights are uploaded to.
pub const MODEL_ARTIFACT_DIR: &str = "model";

/// Optional companions of the weights: (file next to `weights/`, artifact dir).
pub const COMPANION_FILES: &[(&str, &str)] = &[("args.yaml", "config"), ("results.csv", "results")];

/// The best run of an experiment.
#[derive(Debug, Clone)]
pub struct BestRun {
    pub experiment: Experiment,
    pub run: Run,
    pub metric: String,
}

impl BestRun {
    pub fn metric_value(&self) -> Option<f64> {
        self.run.metric(&self.metric)
    }
}

/// Find the run maximizing `metric` among all runs of `experiment_name`,
/// then fetch it in full so the artifact URI is available.
pub async fn find_best_run(
    store: &dyn TrackingStore,
    experiment_name: &str,
    metric: &str,
) -> TrackingResult<BestRun> {
    let experiment = lookup_experiment(store, experiment_name).await?;
    let query = RunQuery::for_experiment(&experiment.id).order(RunOrder::metric_desc(metric));
    let best = select_from(store, &query, experiment_name, metric).await?;
    let run = store.get_run(best.id()).await?;
    Ok(BestRun {
        experiment,
        run,
        metric: metric.to_string(),
    })
}

/// Outcome of [`publish_best`].
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub best: BestRun,
    pub weights_path: PathBuf,
    pub weights_bytes: u64,
    /// Artifact paths uploaded, relative to the run's artifact root.
    pub uploaded: Vec<String>,
    /// `runs:/` URI of the uploaded weights.
    pub model_uri: String,
    pub version: ModelVersion,
}

/// Upload the best finished run's local weights and register them as a new
/// version of `model_name`.
///
/// Only FINISHED runs with a positive `metric` are considered. The weights
/// are expected at `<runs_dir>/<run name>/weights/best.pt`; `args.yaml` and
/// `results.csv` from the same run directory are uploaded when present.
pub async fn publish_best(
    store: &dyn TrackingStore,
    experiment_name: &str,
    metric: &str,
    model_name: &str,
    runs_dir: &Path,
) -> TrackingResult<PublishReport> {
    let experiment = lookup_experiment(store, experiment_name).await?;
    let query = RunQuery::for_experiment(&experiment.id)
        .filter(RunFilter::Status(RunStatus::Finished))
        .filter(RunFilter::metric_above(metric, 0.0))
        .order(RunOrder::metric_desc(metric));
    let best = select_from(store, &query, experiment_name, metric).await?;
    let run = match best.artifact_uri {
        Some(_) => best,
        None => store.get_run(best.id()).await?,
    };

    let run_dir = runs_dir.join(run.display_name());
    let weights_path = run_dir.join(WEIGHTS_FILE);
    let weights_bytes = match std::fs::metadata(&weights_path) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => {
            return Err(TrackingError::not_found(
                "weights",
                weights_path.display().to_string(),
            ));
        }
    };
    info!(run_id = %run.id(), path = %weights_path.display(), bytes = weights_bytes, "found weights");

    let mut uploaded = vec![
        store
            .log_artifact(&run, &weights_path, MODEL_ARTIFACT_DIR)
            .await?,
    ];
    for (file, artifact_dir) in COMPANION_FILES {
        let path = run_dir.join(file);
        if path.is_file() {
            uploaded.push(store.log_artifact(&run, &path, artifact_dir).await?);
        }
    }
    info!(run_id = %run.id(), count = uploaded.len(), "artifacts uploaded");

    let model_uri = format!("runs:/{}/{}", run.id(), uploaded[0]);
    let source = match run.artifact_uri.as_deref() {
        Some(root) => format!("{}/{}", root.trim_end_matches('/'), uploaded[0]),
        None => model_uri.clone(),
    };
    let version = store.register_model(model_name, &source, run.id()).await?;
    info!(model = model_name, version = version.version, "model version registered");

    Ok(PublishReport {
        best: BestRun {
            experiment,
            run,
            metric: metric.to_string(),
        },
        weights_path,
        weights_bytes,
        uploaded,
        model_uri,
        version,
    })
}

async fn lookup_experiment(
    store: &dyn TrackingStore,
    experiment_name: &str,
) -> TrackingResult<Experiment> {
    store
        .experiment_by_name(experiment_name)
        .await?
        .ok_or_else(|| TrackingError::not_found("experiment", experiment_name))
}

async fn select_from(
    store: &dyn TrackingStore,
    query: &RunQuery,
    experiment_name: &str,
    metric: &str,
) -> TrackingResult<Run> {
    let runs = store.search_runs(query).await?;
    if runs.is_empty() {
        return Err(TrackingError::NoRuns {
            experiment: experiment_name.to_string(),
        });
    }
    into_best(runs, metric).ok_or_else(|| TrackingError::NoRuns {
        experiment: experiment_name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn store_with_runs() -> InMemoryStore {
        let store = InMemoryStore::new();
        let exp = store.add_experiment("cv_yolo_tiny");
        for (id, name, map50, status) in [
            ("r1", "exp_a", 0.61, RunStatus::Finished),
            ("r2", "exp_b", 0.83, RunStatus::Finished),
            ("r3", "exp_c", 0.95, RunStatus::Failed),
        ] {
            store.insert_run(
                Run::new(id)
                    .with_experiment(&exp.id)
                    .with_name(name)
                    .with_status(status)
                    .with_artifact_uri(format!("mlflow-artifacts:/{}/{id}/artifacts", exp.id))
                    .with_metric("mAP50", map50),
            );
        }
        store
    }

    #[tokio::test]
    async fn test_find_best_run_considers_all_statuses() {
        let store = store_with_runs();
        let best = find_best_run(&store, "cv_yolo_tiny", "mAP50").await.unwrap();
        assert_eq!(best.run.id().as_str(), "r3");
        assert_eq!(best.metric_value(), Some(0.95));
    }

    #[tokio::test]
    async fn test_publish_uploads_and_registers() {
        let store = store_with_runs();
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("exp_b");
        std::fs::create_dir_all(run_dir.join("weights")).unwrap();
        std::fs::write(run_dir.join(WEIGHTS_FILE), vec![0u8; 2048]).unwrap();
        std::fs::write(run_dir.join("args.yaml"), "imgsz: 320\n").unwrap();

        let report = publish_best(&store, "cv_yolo_tiny", "mAP50", "detector", dir.path())
            .await
            .unwrap();

        assert_eq!(report.best.run.id().as_str(), "r2");
        assert_eq!(report.weights_bytes, 2048);
        assert_eq!(report.uploaded, vec!["model/best.pt", "config/args.yaml"]);
        assert_eq!(report.model_uri, "runs:/r2/model/best.pt");
        assert_eq!(report.version.version, 1);
        assert_eq!(
            report.version.source,
            "mlflow-artifacts:/1/r2/artifacts/model/best.pt"
        );
        assert_eq!(store.artifacts().len(), 2);
    }

    #[tokio::test]
    async fn test_publish_requires_local_weights() {
        let store = store_with_runs();
        let dir = tempfile::tempdir().unwrap();
        let err = publish_best(&store, "cv_yolo_tiny", "mAP50", "detector", dir.path())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.artifacts().is_empty());
        assert!(store.model_versions("detector").is_empty());
    }

    #[tokio::test]
    async fn test_publish_without_eligible_runs() {
        let store = InMemoryStore::new();
        let exp = store.add_experiment("cv_yolo_tiny");
        store.insert_run(Run::new("r1").with_experiment(&exp.id).with_metric("mAP50", 0.0));
        let dir = tempfile::tempdir().unwrap();
        let err = publish_best(&store, "cv_yolo_tiny", "mAP50", "detector", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, TrackingError::NoRuns { .. }));
    }
}
