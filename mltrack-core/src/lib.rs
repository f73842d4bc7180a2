//! # mltrack-core: experiment tracking utilities for YOLO training runs
//!
//! Works against an MLflow-compatible tracking server to:
//! - summarize the runs of an experiment and export a CSV report ([`analysis`])
//! - recover final-epoch metrics from local `results.csv` files ([`recovery`], [`relog`])
//! - pick the best run by a primary metric ([`selection`])
//! - upload the best run's weights and register them as a model version ([`publish`])
//!
//! The server is reached through the [`TrackingStore`] trait. [`MlflowClient`]
//! speaks the REST API; [`InMemoryStore`] backs tests and dry runs.

// Foundation
pub mod config;
pub mod error;
pub mod run;
pub mod store;

// Local training output
pub mod results;

// Workflows
pub mod analysis;
pub mod publish;
pub mod recovery;
pub mod relog;
pub mod selection;

// Re-exports
pub use config::{DivergencePolicy, MltrackConfig, load_config};
pub use error::{TrackingError, TrackingResult};
pub use recovery::{MetricCandidates, MetricRecoverer, RecoveryReport};
pub use run::{Experiment, ModelVersion, Run, RunId, RunStatus};
pub use store::{InMemoryStore, MlflowClient, RunQuery, TrackingStore};
