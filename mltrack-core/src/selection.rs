//! Best-run selection.

use crate::run::Run;
use std::cmp::Ordering;

/// Select the run with the highest value of `metric`.
///
/// Runs without a finite value for `metric` are ignored. Among runs sharing
/// the maximum, the one with the lexicographically smallest id wins, so the
/// result does not depend on the order the store returned the runs in.
pub fn select_best<'a>(runs: &'a [Run], metric: &str) -> Option<&'a Run> {
    runs.iter()
        .filter_map(|run| {
            run.metric(metric)
                .filter(|v| v.is_finite())
                .map(|v| (run, v))
        })
        .max_by(|(a, va), (b, vb)| {
            va.partial_cmp(vb)
                .unwrap_or(Ordering::Equal)
                // Reversed so that the smaller id compares greater and wins.
                .then_with(|| b.id().cmp(a.id()))
        })
        .map(|(run, _)| run)
}

/// Owned variant of [`select_best`].
pub fn into_best(runs: Vec<Run>, metric: &str) -> Option<Run> {
    let id = select_best(&runs, metric)?.id().clone();
    runs.into_iter().find(|r| *r.id() == id)
}
