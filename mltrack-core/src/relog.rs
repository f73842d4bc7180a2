//! Batch metric backfill over an experiment's finished runs.

use crate::error::{TrackingError, TrackingResult};
use crate::recovery::{MetricRecoverer, RecoveryReport};
use crate::results::find_results_file;
use crate::run::{Run, RunStatus};
use crate::store::{Direction, RunFilter, RunOrder, RunQuery, TrackingStore};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Per-run result of a batch backfill.
#[derive(Debug, Clone)]
pub enum RelogOutcome {
    /// A results file was found and processed.
    Recovered {
        results_path: PathBuf,
        report: RecoveryReport,
    },
    /// No `results.csv` was found for the run.
    NoResults,
    /// A results file was found but could not be used.
    Failed {
        results_path: PathBuf,
        error: String,
    },
}

/// One run and what happened to it.
#[derive(Debug, Clone)]
pub struct RunRelog {
    pub run: Run,
    pub outcome: RelogOutcome,
}

impl RunRelog {
    pub fn is_updated(&self) -> bool {
        matches!(&self.outcome, RelogOutcome::Recovered { report, .. } if report.is_updated())
    }
}

/// Result of [`relog_experiment`].
#[derive(Debug, Clone, Default)]
pub struct RelogSummary {
    pub runs: Vec<RunRelog>,
}

impl RelogSummary {
    pub fn total(&self) -> usize {
        self.runs.len()
    }

    pub fn updated(&self) -> usize {
        self.runs.iter().filter(|r| r.is_updated()).count()
    }
}

/// Backfill metrics for every FINISHED run of `experiment_name` from the
/// `results.csv` files found under `runs_dir`.
///
/// Runs are processed one after another, newest first. A failure on one
/// run is recorded in its outcome and does not stop the batch.
pub async fn relog_experiment(
    store: &dyn TrackingStore,
    recoverer: &MetricRecoverer<'_>,
    experiment_name: &str,
    runs_dir: &Path,
) -> TrackingResult<RelogSummary> {
    let experiment = store
        .experiment_by_name(experiment_name)
        .await?
        .ok_or_else(|| TrackingError::not_found("experiment", experiment_name))?;

    let query = RunQuery::for_experiment(&experiment.id)
        .filter(RunFilter::Status(RunStatus::Finished))
        .order(RunOrder::StartTime(Direction::Desc));
    let runs = store.search_runs(&query).await?;
    if runs.is_empty() {
        return Err(TrackingError::NoRuns {
            experiment: experiment_name.to_string(),
        });
    }
    info!(experiment = experiment_name, runs = runs.len(), "backfilling finished runs");

    let mut summary = RelogSummary::default();
    for run in runs {
        let found = run.name().and_then(|name| find_results_file(runs_dir, name));
        let outcome = match found {
            None => {
                warn!(run_id = %run.id(), name = run.display_name(), "no results.csv found");
                RelogOutcome::NoResults
            }
            Some(results_path) => match recoverer.recover_file(&run, &results_path).await {
                Ok(report) => RelogOutcome::Recovered {
                    results_path,
                    report,
                },
                Err(e) => {
                    warn!(run_id = %run.id(), path = %results_path.display(), error = %e, "backfill failed");
                    RelogOutcome::Failed {
                        results_path,
                        error: e.to_string(),
                    }
                }
            },
        };
        summary.runs.push(RunRelog { run, outcome });
    }

    info!(
        total = summary.total(),
        updated = summary.updated(),
        "backfill finished"
    );
    Ok(summary)
}
