//! Averaging of stepped backtest runs.
//!
//! A stepped sweep evaluates the same configuration from several start dates.
//! Rows that share a [`HashSpan`] are collapsed into one row whose metrics are
//! the arithmetic mean of the group, which reduces the influence of any single
//! start date on the ranking.

use crate::results::{HashSpan, Metrics, ResultRow, ResultTable};
use std::collections::HashMap;
use tracing::debug;

/// Collapse rows sharing a [`HashSpan`] into one averaged row per key.
///
/// For each group:
/// - `Start Date` is the earliest start, `End Date` the latest end;
/// - `Duration` is the mean duration rounded to the nearest second;
/// - the hash span is copied from the first row of the group;
/// - `# Stepped Tests` is the number of runs merged (the sum of the rows' own
///   counts, so already-averaged rows keep their count);
/// - every metric is the arithmetic mean over the group.
///
/// Groups are emitted in order of first appearance.
pub fn average_stepped(table: &ResultTable) -> ResultTable {
    let mut index: HashMap<&HashSpan, usize> = HashMap::new();
    let mut groups: Vec<Vec<&ResultRow>> = Vec::new();

    for row in table.rows() {
        match index.get(&row.key) {
            Some(&g) => groups[g].push(row),
            None => {
                index.insert(&row.key, groups.len());
                groups.push(vec![row]);
            }
        }
    }

    debug!(
        "Averaging {} rows into {} configurations",
        table.len(),
        groups.len()
    );

    ResultTable::new(groups.into_iter().filter_map(merge_group).collect())
}

fn merge_group(rows: Vec<&ResultRow>) -> Option<ResultRow> {
    let first = *rows.first()?;

    let start_date = rows.iter().map(|r| r.start_date).min()?;
    let end_date = rows.iter().map(|r| r.end_date).max()?;
    let mean_duration =
        rows.iter().map(|r| r.duration_secs as f64).sum::<f64>() / rows.len() as f64;
    let metrics = Metrics::mean(rows.iter().map(|r| &r.metrics))?;
    let stepped_tests = rows.iter().map(|r| r.stepped_tests.max(1)).sum();

    Some(ResultRow {
        start_date,
        end_date,
        duration_secs: mean_duration.round() as i64,
        key: first.key.clone(),
        stepped_tests,
        metrics,
    })
}
