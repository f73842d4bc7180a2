//! Experiment analysis: per-run summary table, metric statistics and the
//! CSV report.

use crate::error::{TrackingError, TrackingResult};
use crate::run::{Experiment, Run};
use crate::selection::into_best;
use crate::store::{Direction, RunOrder, RunQuery, TrackingStore};
use chrono::SecondsFormat;
use std::path::{Path, PathBuf};
use tracing::info;

/// File name of the analysis report inside the reports directory.
pub const REPORT_FILE: &str = "runs_analysis.csv";

/// Parameters shown in the summary: (stored key, column label).
pub const DISPLAY_PARAMS: &[(&str, &str)] = &[
    ("imgsz", "img_size"),
    ("lr0", "lr"),
    ("seed", "seed"),
    ("epochs", "epochs"),
];

/// Metrics shown in the summary: (stored key, column label).
pub const DISPLAY_METRICS: &[(&str, &str)] = &[
    ("mAP50", "mAP@50"),
    ("mAP50-95", "mAP@50-95"),
    ("precision", "precision"),
    ("recall", "recall"),
];

/// Tabular run summary. Missing cells are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SummaryTable {
    /// Build the summary for `runs`, keeping their order.
    ///
    /// A parameter or metric column appears only when at least one run
    /// carries it.
    pub fn from_runs(runs: &[Run]) -> Self {
        let params: Vec<&(&str, &str)> = DISPLAY_PARAMS
            .iter()
            .filter(|(key, _)| runs.iter().any(|r| r.param(key).is_some()))
            .collect();
        let metrics: Vec<&(&str, &str)> = DISPLAY_METRICS
            .iter()
            .filter(|(key, _)| runs.iter().any(|r| r.metric(key).is_some()))
            .collect();

        let mut headers = vec![
            "run_id".to_string(),
            "start_time".to_string(),
            "status".to_string(),
        ];
        headers.extend(params.iter().map(|(_, label)| label.to_string()));
        headers.extend(metrics.iter().map(|(_, label)| label.to_string()));

        let rows = runs
            .iter()
            .map(|run| {
                let mut row = vec![
                    run.id().to_string(),
                    run.start_time
                        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                        .unwrap_or_default(),
                    run.status.to_string(),
                ];
                row.extend(
                    params
                        .iter()
                        .map(|(key, _)| run.param(key).unwrap_or_default().to_string()),
                );
                row.extend(metrics.iter().map(|(key, _)| {
                    run.metric(key)
                        .filter(|v| !v.is_nan())
                        .map(|v| v.to_string())
                        .unwrap_or_default()
                }));
                row
            })
            .collect();

        Self { headers, rows }
    }

    /// Write the table as CSV, creating parent directories.
    pub fn write_csv(&self, path: &Path) -> TrackingResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Summary statistics of one metric across runs.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricStats {
    pub label: String,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Sample standard deviation; `None` for fewer than two values.
    pub std: Option<f64>,
}

impl MetricStats {
    /// Statistics over `values`, skipping NaN. `None` when nothing remains.
    pub fn compute(label: impl Into<String>, values: &[f64]) -> Option<Self> {
        let values: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let n = count as f64;
        let mean = values.iter().sum::<f64>() / n;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let std = (count > 1).then(|| {
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
            var.sqrt()
        });
        Some(Self {
            label: label.into(),
            count,
            min,
            max,
            mean,
            std,
        })
    }
}

/// Statistics for every display metric carried by at least one run.
pub fn metric_stats(runs: &[Run]) -> Vec<MetricStats> {
    DISPLAY_METRICS
        .iter()
        .filter_map(|(key, label)| {
            let values: Vec<f64> = runs.iter().filter_map(|r| r.metric(key)).collect();
            MetricStats::compute(*label, &values)
        })
        .collect()
}

/// Everything the `analyze` command reports.
#[derive(Debug, Clone)]
pub struct ExperimentAnalysis {
    pub experiment: Experiment,
    pub summary: SummaryTable,
    pub stats: Vec<MetricStats>,
    pub best: Option<Run>,
    /// Metric `best` was chosen by.
    pub ranked_by: String,
}

impl ExperimentAnalysis {
    pub fn run_count(&self) -> usize {
        self.summary.rows.len()
    }

    /// Write the summary to `<reports_dir>/runs_analysis.csv`.
    pub fn write_report(&self, reports_dir: &Path) -> TrackingResult<PathBuf> {
        let path = reports_dir.join(REPORT_FILE);
        self.summary.write_csv(&path)?;
        info!(path = %path.display(), rows = self.summary.rows.len(), "report written");
        Ok(path)
    }
}

/// Summarize every run of `experiment_name`, newest first.
pub async fn analyze_experiment(
    store: &dyn TrackingStore,
    experiment_name: &str,
    primary_metric: &str,
) -> TrackingResult<ExperimentAnalysis> {
    let experiment = store
        .experiment_by_name(experiment_name)
        .await?
        .ok_or_else(|| TrackingError::not_found("experiment", experiment_name))?;

    let query =
        RunQuery::for_experiment(&experiment.id).order(RunOrder::StartTime(Direction::Desc));
    let runs = store.search_runs(&query).await?;
    if runs.is_empty() {
        return Err(TrackingError::NoRuns {
            experiment: experiment_name.to_string(),
        });
    }
    info!(experiment = experiment_name, runs = runs.len(), "analyzing runs");

    let summary = SummaryTable::from_runs(&runs);
    let stats = metric_stats(&runs);
    let best = into_best(runs, primary_metric);

    Ok(ExperimentAnalysis {
        experiment,
        summary,
        stats,
        best,
        ranked_by: primary_metric.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunStatus;
    use pretty_assertions::assert_eq;

    fn sample_runs() -> Vec<Run> {
        vec![
            Run::new("r1")
                .with_param("imgsz", "320")
                .with_param("lr0", "0.01")
                .with_metric("mAP50", 0.6)
                .with_metric("precision", 0.7),
            Run::new("r2")
                .with_status(RunStatus::Failed)
                .with_param("imgsz", "640")
                .with_metric("mAP50", 0.8),
        ]
    }

    #[test]
    fn test_summary_includes_only_present_columns() {
        let table = SummaryTable::from_runs(&sample_runs());
        assert_eq!(
            table.headers,
            vec!["run_id", "start_time", "status", "img_size", "lr", "mAP@50", "precision"]
        );
        assert_eq!(table.rows[0], vec!["r1", "", "FINISHED", "320", "0.01", "0.6", "0.7"]);
        assert_eq!(table.rows[1], vec!["r2", "", "FAILED", "640", "", "0.8", ""]);
    }

    #[test]
    fn test_stats_use_sample_std() {
        let stats = MetricStats::compute("mAP@50", &[0.6, 0.8]).unwrap();
        assert_eq!(stats.count, 2);
        assert!((stats.mean - 0.7).abs() < 1e-12);
        assert_eq!(stats.min, 0.6);
        assert_eq!(stats.max, 0.8);
        assert!((stats.std.unwrap() - 0.141_421_356_237).abs() < 1e-9);
    }

    #[test]
    fn test_single_value_has_no_std() {
        let stats = MetricStats::compute("recall", &[0.5, f64::NAN]).unwrap();
        assert_eq!(stats.count, 1);
        assert!(stats.std.is_none());
        assert!(MetricStats::compute("recall", &[]).is_none());
    }

    #[test]
    fn test_metric_stats_follow_display_order() {
        let stats = metric_stats(&sample_runs());
        let labels: Vec<&str> = stats.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["mAP@50", "precision"]);
    }

    #[test]
    fn test_write_csv_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join(REPORT_FILE);
        SummaryTable::from_runs(&sample_runs()).write_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("run_id,start_time,status,img_size,lr,mAP@50,precision")
        );
        assert_eq!(lines.next(), Some("r1,,FINISHED,320,0.01,0.6,0.7"));
    }
}
