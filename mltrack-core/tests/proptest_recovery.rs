//! Property-based tests for metric recovery using proptest.

use proptest::prelude::*;

use mltrack_core::recovery::MetricCandidates;
use mltrack_core::results::{ResultsRow, ResultsTable};

const COLUMNS: &[&str] = &[
    "metrics/precision(B)",
    "metrics/precision",
    "metrics/recall(B)",
    "metrics/recall",
    "metrics/mAP50(B)",
    "metrics/mAP50",
    "metrics/mAP50-95(B)",
    "metrics/mAP50-95",
    "metrics/mAP50-95(M)",
];

fn cell() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        (0.0f64..1.0).prop_map(|v| Some(format!("{v:.5}"))),
        Just(Some("n/a".to_string())),
        Just(Some(String::new())),
    ]
}

fn row(cells: &[Option<String>]) -> ResultsRow {
    COLUMNS
        .iter()
        .zip(cells)
        .filter_map(|(col, cell)| cell.as_ref().map(|v| (*col, v.as_str())))
        .collect()
}

proptest! {
    #[test]
    fn recovery_is_deterministic(cells in prop::collection::vec(cell(), COLUMNS.len())) {
        let table = ResultsTable::new(Vec::new(), vec![row(&cells)]);
        let candidates = MetricCandidates::default();
        prop_assert_eq!(candidates.recover(&table), candidates.recover(&table));
    }

    #[test]
    fn recovered_metrics_come_from_present_numeric_columns(
        cells in prop::collection::vec(cell(), COLUMNS.len()),
    ) {
        let r = row(&cells);
        let table = ResultsTable::new(Vec::new(), vec![r.clone()]);
        let recovery = MetricCandidates::default().recover(&table);

        for (canonical, columns) in MetricCandidates::default().iter() {
            let first_numeric = columns
                .iter()
                .filter_map(|c| r.get(c))
                .find_map(|raw| raw.trim().parse::<f64>().ok().filter(|v| v.is_finite()));
            prop_assert_eq!(recovery.metrics.get(canonical).copied(), first_numeric);
        }
    }

    #[test]
    fn only_the_final_row_counts(
        first in prop::collection::vec(cell(), COLUMNS.len()),
        last in prop::collection::vec(cell(), COLUMNS.len()),
    ) {
        let candidates = MetricCandidates::default();
        let both = ResultsTable::new(Vec::new(), vec![row(&first), row(&last)]);
        let only_last = ResultsTable::new(Vec::new(), vec![row(&last)]);
        prop_assert_eq!(candidates.recover(&both).metrics, candidates.recover(&only_last).metrics);
    }
}
