//! Metric recovery: read the final row of a results table, map drifting
//! column names to canonical metric names and backfill them into the store.

use crate::config::DivergencePolicy;
use crate::error::{TrackingError, TrackingResult};
use crate::results::{ResultsRow, ResultsTable};
use crate::run::Run;
use crate::store::TrackingStore;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Column holding the epoch number of a results row.
pub const EPOCH_COLUMN: &str = "epoch";

/// Canonical metric name -> acceptable source columns, in priority order.
///
/// Tolerates naming drift across trainer versions: the first column that is
/// present and numerically parseable wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricCandidates {
    entries: Vec<(String, Vec<String>)>,
}

impl MetricCandidates {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Declare a canonical metric and its source columns. Re-declaring a
    /// metric replaces its columns but keeps its position.
    pub fn with_metric<I, S>(mut self, canonical: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let canonical = canonical.into();
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        match self.entries.iter_mut().find(|(name, _)| *name == canonical) {
            Some(entry) => entry.1 = columns,
            None => self.entries.push((canonical, columns)),
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, cols)| (name.as_str(), cols.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recover canonical metrics from the final row of `table`.
    pub fn recover(&self, table: &ResultsTable) -> Recovery {
        match table.last_row() {
            Some(row) => self.recover_row(row),
            None => Recovery {
                warnings: vec![RecoveryWarning::EmptyTable],
                ..Default::default()
            },
        }
    }

    /// Recover canonical metrics from a single row.
    pub fn recover_row(&self, row: &ResultsRow) -> Recovery {
        let mut metrics = BTreeMap::new();
        let mut warnings = Vec::new();

        for (canonical, columns) in self.iter() {
            for column in columns {
                let Some(raw) = row.get(column) else {
                    continue;
                };
                match parse_metric(raw) {
                    Some(value) => {
                        metrics.insert(canonical.to_string(), value);
                        break;
                    }
                    None => warnings.push(RecoveryWarning::Unparseable {
                        metric: canonical.to_string(),
                        column: column.clone(),
                        raw: raw.to_string(),
                    }),
                }
            }
        }

        if metrics.is_empty() {
            warnings.push(RecoveryWarning::NoMetricsFound);
        }
        let step = row.get(EPOCH_COLUMN).and_then(parse_step);
        Recovery {
            metrics,
            warnings,
            step,
        }
    }
}

impl Default for MetricCandidates {
    /// Column names written by Ultralytics YOLO across releases.
    fn default() -> Self {
        Self::new()
            .with_metric(
                "precision",
                ["metrics/precision(B)", "metrics/precision"],
            )
            .with_metric("recall", ["metrics/recall(B)", "metrics/recall"])
            .with_metric("mAP50", ["metrics/mAP50(B)", "metrics/mAP50"])
            .with_metric(
                "mAP50-95",
                [
                    "metrics/mAP50-95(B)",
                    "metrics/mAP50-95",
                    "metrics/mAP50-95(M)",
                ],
            )
    }
}

/// A cell is a metric value when its trimmed text parses as a finite float.
fn parse_metric(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Epoch cells are integers, though some writers emit `12.0`.
fn parse_step(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    raw.parse::<i64>()
        .ok()
        .or_else(|| parse_metric(raw).filter(|v| v.fract() == 0.0).map(|v| v as i64))
}

/// Something noteworthy that did not prevent recovery.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryWarning {
    /// The table had no data rows.
    EmptyTable,
    /// No canonical metric could be recovered from the final row.
    NoMetricsFound,
    /// A candidate column was present but not numeric.
    Unparseable {
        metric: String,
        column: String,
        raw: String,
    },
}

impl std::fmt::Display for RecoveryWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryWarning::EmptyTable => write!(f, "results table has no rows"),
            RecoveryWarning::NoMetricsFound => write!(f, "no metrics found in the final row"),
            RecoveryWarning::Unparseable {
                metric,
                column,
                raw,
            } => write!(f, "{metric}: column '{column}' is not numeric ('{raw}')"),
        }
    }
}

/// Output of the pure recovery step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recovery {
    pub metrics: BTreeMap<String, f64>,
    pub warnings: Vec<RecoveryWarning>,
    /// Epoch of the final row, when the table records one.
    pub step: Option<i64>,
}

/// A recovered value that differs from the one already stored.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDivergence {
    pub metric: String,
    pub stored: f64,
    pub recovered: f64,
}

/// What happened when one run's metrics were backfilled.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub run_id: String,
    pub recovered: BTreeMap<String, f64>,
    /// Step the metrics were logged at.
    pub step: i64,
    pub warnings: Vec<RecoveryWarning>,
    /// Metrics written to the store.
    pub logged: Vec<String>,
    /// Metrics already stored with the identical value.
    pub unchanged: Vec<String>,
    /// Metrics whose stored value differed from the recovered one.
    pub diverged: Vec<MetricDivergence>,
    /// Metrics whose write failed, with the error text.
    pub failed: Vec<(String, String)>,
}

impl RecoveryReport {
    /// True when the run now carries at least one recovered metric.
    pub fn is_updated(&self) -> bool {
        !self.logged.is_empty() || !self.unchanged.is_empty()
    }

    /// `PartialLog` error when any metric write failed.
    pub fn partial_failure(&self) -> Option<TrackingError> {
        if self.failed.is_empty() {
            return None;
        }
        Some(TrackingError::PartialLog {
            run_id: self.run_id.clone(),
            total: self.recovered.len(),
            failed: self.failed.iter().map(|(m, _)| m.clone()).collect(),
        })
    }
}

/// Backfills recovered metrics into a tracking store.
pub struct MetricRecoverer<'a> {
    store: &'a dyn TrackingStore,
    candidates: MetricCandidates,
    on_divergence: DivergencePolicy,
}

impl<'a> MetricRecoverer<'a> {
    pub fn new(store: &'a dyn TrackingStore) -> Self {
        Self {
            store,
            candidates: MetricCandidates::default(),
            on_divergence: DivergencePolicy::default(),
        }
    }

    pub fn with_candidates(mut self, candidates: MetricCandidates) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn with_divergence_policy(mut self, policy: DivergencePolicy) -> Self {
        self.on_divergence = policy;
        self
    }

    /// Load `results_path` and backfill its final-row metrics into `run`.
    ///
    /// A missing file, malformed CSV or a table without data rows fails
    /// before anything is logged.
    pub async fn recover_file(
        &self,
        run: &Run,
        results_path: &Path,
    ) -> TrackingResult<RecoveryReport> {
        let table = ResultsTable::load(results_path)?;
        if table.is_empty() {
            return Err(TrackingError::EmptyResults {
                path: results_path.to_path_buf(),
            });
        }
        Ok(self.recover_table(run, &table).await)
    }

    /// Backfill the final-row metrics of `table` into `run`.
    ///
    /// Values are logged at the final row's epoch (step 0 without an epoch
    /// column) so they rank as the run's latest next to the values the
    /// trainer logged per epoch. Each metric is logged independently: a
    /// failed write is recorded in the report and the remaining metrics are
    /// still attempted.
    pub async fn recover_table(&self, run: &Run, table: &ResultsTable) -> RecoveryReport {
        let Recovery {
            metrics,
            warnings,
            step,
        } = self.candidates.recover(table);
        let step = step.unwrap_or(0);
        let mut report = RecoveryReport {
            run_id: run.id().to_string(),
            recovered: metrics.clone(),
            step,
            warnings,
            ..Default::default()
        };

        if metrics.is_empty() {
            warn!(run_id = %run.id(), "no metrics found in results table");
            return report;
        }

        for (key, value) in metrics {
            if let Some(stored) = run.metric(&key) {
                if stored == value {
                    debug!(run_id = %run.id(), key = %key, value, "metric already stored");
                    report.unchanged.push(key);
                    continue;
                }
                warn!(
                    run_id = %run.id(),
                    key = %key,
                    stored,
                    recovered = value,
                    policy = %self.on_divergence,
                    "recovered metric differs from stored value"
                );
                report.diverged.push(MetricDivergence {
                    metric: key.clone(),
                    stored,
                    recovered: value,
                });
                if self.on_divergence == DivergencePolicy::Keep {
                    continue;
                }
            }

            match self.store.log_metric(run.id(), &key, value, step).await {
                Ok(()) => report.logged.push(key),
                Err(e) => {
                    warn!(run_id = %run.id(), key = %key, error = %e, "failed to log metric");
                    report.failed.push((key, e.to_string()));
                }
            }
        }

        info!(
            run_id = %run.id(),
            step,
            logged = report.logged.len(),
            unchanged = report.unchanged.len(),
            failed = report.failed.len(),
            "metrics backfilled"
        );
        report
    }
}
