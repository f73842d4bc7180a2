//! Tracking-store abstraction.
//!
//! `TrackingStore` is the seam between mltrack's logic and the external
//! experiment-tracking service. `MlflowClient` talks to a real server over
//! HTTP; `InMemoryStore` keeps everything in process for tests and dry runs.

pub mod memory;
pub mod mlflow;

use crate::error::TrackingResult;
use crate::run::{Experiment, ModelVersion, Run, RunId, RunStatus};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::path::Path;

pub use memory::InMemoryStore;
pub use mlflow::MlflowClient;

/// Operations mltrack needs from an experiment-tracking service.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Look up an experiment by name. `Ok(None)` when it does not exist.
    async fn experiment_by_name(&self, name: &str) -> TrackingResult<Option<Experiment>>;

    /// Search runs, returned in the order requested by the query.
    async fn search_runs(&self, query: &RunQuery) -> TrackingResult<Vec<Run>>;

    /// Fetch a single run with its latest metrics.
    async fn get_run(&self, run_id: &RunId) -> TrackingResult<Run>;

    /// Log one metric value at `step`.
    ///
    /// The store reports as latest the value with the highest step, newer
    /// writes winning within a step. Logging an identical value again is
    /// harmless.
    async fn log_metric(
        &self,
        run_id: &RunId,
        key: &str,
        value: f64,
        step: i64,
    ) -> TrackingResult<()>;

    /// Upload a local file under `artifact_dir` in the run's artifact root.
    /// Returns the artifact path relative to that root.
    async fn log_artifact(
        &self,
        run: &Run,
        local_path: &Path,
        artifact_dir: &str,
    ) -> TrackingResult<String>;

    /// Register `source` as a new version of model `name`.
    async fn register_model(
        &self,
        name: &str,
        source: &str,
        run_id: &RunId,
    ) -> TrackingResult<ModelVersion>;
}

/// Sort direction for a [`RunOrder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// Structured run filter, rendered to the store's filter syntax.
#[derive(Debug, Clone, PartialEq)]
pub enum RunFilter {
    Status(RunStatus),
    MetricAbove { key: String, threshold: f64 },
}

impl RunFilter {
    pub fn metric_above(key: impl Into<String>, threshold: f64) -> Self {
        RunFilter::MetricAbove {
            key: key.into(),
            threshold,
        }
    }

    /// MLflow search syntax for this clause.
    pub fn to_clause(&self) -> String {
        match self {
            RunFilter::Status(status) => format!("attributes.status = '{status}'"),
            RunFilter::MetricAbove { key, threshold } => {
                format!("metrics.{} > {threshold}", quote_key(key))
            }
        }
    }

    pub fn matches(&self, run: &Run) -> bool {
        match self {
            RunFilter::Status(status) => run.status == *status,
            RunFilter::MetricAbove { key, threshold } => {
                run.metric(key).is_some_and(|v| v > *threshold)
            }
        }
    }
}

/// Structured ordering clause.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOrder {
    StartTime(Direction),
    Metric { key: String, direction: Direction },
}

impl RunOrder {
    pub fn metric_desc(key: impl Into<String>) -> Self {
        RunOrder::Metric {
            key: key.into(),
            direction: Direction::Desc,
        }
    }

    pub fn to_clause(&self) -> String {
        match self {
            RunOrder::StartTime(dir) => format!("start_time {}", dir.as_str()),
            RunOrder::Metric { key, direction } => {
                format!("metrics.{} {}", quote_key(key), direction.as_str())
            }
        }
    }

    /// Compare two runs under this clause. Runs lacking the value sort last.
    pub fn compare(&self, a: &Run, b: &Run) -> Ordering {
        match self {
            RunOrder::StartTime(dir) => compare_optional(a.start_time, b.start_time, *dir),
            RunOrder::Metric { key, direction } => compare_optional(
                a.metric(key).filter(|v| !v.is_nan()),
                b.metric(key).filter(|v| !v.is_nan()),
                *direction,
            ),
        }
    }
}

fn compare_optional<T: PartialOrd>(a: Option<T>, b: Option<T>, dir: Direction) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => {
            let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
            match dir {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Backtick-quote keys that are not plain identifiers (e.g. `mAP50-95`).
fn quote_key(key: &str) -> String {
    if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        key.to_string()
    } else {
        format!("`{key}`")
    }
}

/// A run search request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunQuery {
    pub experiment_ids: Vec<String>,
    pub filters: Vec<RunFilter>,
    pub order_by: Vec<RunOrder>,
    pub max_results: Option<usize>,
}

impl RunQuery {
    pub fn for_experiment(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_ids: vec![experiment_id.into()],
            ..Default::default()
        }
    }

    pub fn filter(mut self, filter: RunFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, order: RunOrder) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    /// Filters joined with `and`; empty when unfiltered.
    pub fn filter_string(&self) -> String {
        self.filters
            .iter()
            .map(RunFilter::to_clause)
            .collect::<Vec<_>>()
            .join(" and ")
    }

    pub fn order_clauses(&self) -> Vec<String> {
        self.order_by.iter().map(RunOrder::to_clause).collect()
    }

    pub fn matches(&self, run: &Run) -> bool {
        (self.experiment_ids.is_empty() || self.experiment_ids.contains(&run.experiment_id))
            && self.filters.iter().all(|f| f.matches(run))
    }

    /// Compare two runs by the ordering clauses, in declaration order.
    pub fn compare(&self, a: &Run, b: &Run) -> Ordering {
        self.order_by
            .iter()
            .map(|o| o.compare(a, b))
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}
