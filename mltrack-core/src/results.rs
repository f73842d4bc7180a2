//! Local per-run results tables (`results.csv`) and their discovery.

use crate::error::{TrackingError, TrackingResult};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File name the trainer writes epoch metrics to.
pub const RESULTS_FILE: &str = "results.csv";

/// One logged epoch/step: column name -> raw cell text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultsRow {
    values: HashMap<String, String>,
}

impl ResultsRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResultsRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Ordered rows of a results table. The last row is the run's final state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultsTable {
    columns: Vec<String>,
    rows: Vec<ResultsRow>,
}

impl ResultsTable {
    pub fn new(columns: Vec<String>, rows: Vec<ResultsRow>) -> Self {
        Self { columns, rows }
    }

    /// Parse CSV text. Header names and cells are trimmed, since some trainer
    /// versions pad columns with spaces.
    pub fn from_reader<R: Read>(reader: R) -> TrackingResult<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let columns: Vec<String> = csv.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in csv.records() {
            let record = record?;
            let row: ResultsRow = columns
                .iter()
                .zip(record.iter())
                .map(|(c, v)| (c.clone(), v.to_string()))
                .collect();
            rows.push(row);
        }
        Ok(Self { columns, rows })
    }

    /// Load a results table from disk.
    pub fn load(path: &Path) -> TrackingResult<Self> {
        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TrackingError::not_found(
                    "results file",
                    path.display().to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_reader(file).map_err(|e| match e {
            TrackingError::Csv(err) => {
                TrackingError::parse(path.display().to_string(), err.to_string())
            }
            other => other,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[ResultsRow] {
        &self.rows
    }

    pub fn last_row(&self) -> Option<&ResultsRow> {
        self.rows.last()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Candidate `results.csv` locations for a run, in lookup order.
///
/// `<runs>/<name>`, then `<runs>/detect/<name>`, then every immediate
/// sub-directory of `<runs>` whose name contains the run name.
pub fn results_candidates(runs_dir: &Path, run_name: &str) -> Vec<PathBuf> {
    let mut candidates = vec![
        runs_dir.join(run_name).join(RESULTS_FILE),
        runs_dir.join("detect").join(run_name).join(RESULTS_FILE),
    ];

    if runs_dir.is_dir() {
        let matching = WalkDir::new(runs_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_dir())
            .filter(|entry| entry.file_name().to_string_lossy().contains(run_name))
            .map(|entry| entry.path().join(RESULTS_FILE));
        candidates.extend(matching);
    }
    candidates
}

/// First existing `results.csv` for a run, probing sequentially.
///
/// A blank run name matches nothing.
pub fn find_results_file(runs_dir: &Path, run_name: &str) -> Option<PathBuf> {
    if run_name.trim().is_empty() {
        return None;
    }
    results_candidates(runs_dir, run_name)
        .into_iter()
        .find(|p| p.is_file())
}
