//! Error types for the mltrack-core crate.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type TrackingResult<T> = Result<T, TrackingError>;

/// Top-level error type for tracking-store and recovery operations.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("Parse error in {context}: {message}")]
    Parse { context: String, message: String },

    #[error("Failed to log {} of {total} metric(s) for run {run_id}: {}", failed.len(), failed.join(", "))]
    PartialLog {
        run_id: String,
        total: usize,
        failed: Vec<String>,
    },

    #[error("Tracking server unreachable at {uri}: {message}")]
    Network { uri: String, message: String },

    #[error("Tracking server rejected request ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Results table has no data rows: {}", path.display())]
    EmptyResults { path: PathBuf },

    #[error("No runs matched in experiment '{experiment}'")]
    NoRuns { experiment: String },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrackingError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn parse(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn network(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            uri: uri.into(),
            message: message.into(),
        }
    }

    /// True for errors that mean the requested entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
