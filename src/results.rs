//! Backtest result rows and tables.
//!
//! A [`ResultRow`] holds the outcome of one backtest window together with the
//! parameters that produced it. Its columns, in order, are:
//!
//! | Column | Field |
//! |--------|-------|
//! | `Start Date`, `End Date`, `Duration` | window of the run |
//! | `Stocks` … `Starting Value` | [`HashSpan`], the configuration key |
//! | `# Stepped Tests` | number of runs merged into the row |
//! | `Ending Value` … `Rebalances` | [`Metrics`] |
//!
//! Rows sharing a [`HashSpan`] describe the same configuration evaluated from
//! different start dates; see [`crate::aggregate`].

use crate::error::Result;
use crate::types::StrategyKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::Path;
use tabled::{builder::Builder, settings::Style};
use tracing::info;

/// Column names used for CSV export, in column order.
pub const COLUMNS: [&str; 17] = [
    "Start Date",
    "End Date",
    "Duration",
    "Stocks",
    "Strategy",
    "Candidate",
    "rebal_proportions (p)",
    "rebal_interval",
    "Starting Value",
    "# Stepped Tests",
    "Ending Value",
    "Total Return",
    "CAGR",
    "Sharpe",
    "Max Drawdown",
    "Volatility",
    "Rebalances",
];

/// Configuration columns identifying "the same run, different start date".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashSpan {
    /// Comma-joined tickers.
    pub stocks: String,
    pub strategy: StrategyKind,
    /// Correlation id of the optimizer candidate that produced the row.
    pub candidate: Option<usize>,
    /// Serialized allocation, e.g. `[0.75, 0.25]`.
    pub rebal_proportions: String,
    pub rebal_interval: usize,
    pub starting_value: f64,
}

impl PartialEq for HashSpan {
    fn eq(&self, other: &Self) -> bool {
        self.stocks == other.stocks
            && self.strategy == other.strategy
            && self.candidate == other.candidate
            && self.rebal_proportions == other.rebal_proportions
            && self.rebal_interval == other.rebal_interval
            && self.starting_value.to_bits() == other.starting_value.to_bits()
    }
}

impl Eq for HashSpan {}

impl Hash for HashSpan {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.stocks.hash(state);
        self.strategy.hash(state);
        self.candidate.hash(state);
        self.rebal_proportions.hash(state);
        self.rebal_interval.hash(state);
        self.starting_value.to_bits().hash(state);
    }
}

/// Performance metrics of one run. All fields are averaged when stepped runs
/// are merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub ending_value: f64,
    /// Total return as a fraction (0.25 = +25%).
    pub total_return: f64,
    /// Compound annual growth rate as a fraction.
    pub cagr: f64,
    /// Annualized Sharpe ratio.
    pub sharpe: f64,
    /// Maximum peak-to-trough drawdown as a fraction.
    pub max_drawdown: f64,
    /// Annualized volatility of period returns.
    pub volatility: f64,
    /// Number of rebalances performed.
    pub rebalances: f64,
}

impl Metrics {
    /// Arithmetic mean of each field. Returns `None` for an empty input.
    pub fn mean<'a>(metrics: impl IntoIterator<Item = &'a Metrics>) -> Option<Metrics> {
        let mut sum = Metrics::default();
        let mut n = 0usize;
        for m in metrics {
            sum.ending_value += m.ending_value;
            sum.total_return += m.total_return;
            sum.cagr += m.cagr;
            sum.sharpe += m.sharpe;
            sum.max_drawdown += m.max_drawdown;
            sum.volatility += m.volatility;
            sum.rebalances += m.rebalances;
            n += 1;
        }
        if n == 0 {
            return None;
        }
        let n = n as f64;
        Some(Metrics {
            ending_value: sum.ending_value / n,
            total_return: sum.total_return / n,
            cagr: sum.cagr / n,
            sharpe: sum.sharpe / n,
            max_drawdown: sum.max_drawdown / n,
            volatility: sum.volatility / n,
            rebalances: sum.rebalances / n,
        })
    }
}

/// One evaluated backtest window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Window length in whole seconds.
    pub duration_secs: i64,
    pub key: HashSpan,
    /// Number of runs merged into this row (1 for a raw evaluation).
    pub stepped_tests: usize,
    pub metrics: Metrics,
}

impl ResultRow {
    pub fn cagr(&self) -> f64 {
        self.metrics.cagr
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.start_date.format("%Y-%m-%d %H:%M:%S").to_string(),
            self.end_date.format("%Y-%m-%d %H:%M:%S").to_string(),
            self.duration_secs.to_string(),
            self.key.stocks.clone(),
            self.key.strategy.to_string(),
            self.key
                .candidate
                .map(|c| c.to_string())
                .unwrap_or_default(),
            self.key.rebal_proportions.clone(),
            self.key.rebal_interval.to_string(),
            self.key.starting_value.to_string(),
            self.stepped_tests.to_string(),
            self.metrics.ending_value.to_string(),
            self.metrics.total_return.to_string(),
            self.metrics.cagr.to_string(),
            self.metrics.sharpe.to_string(),
            self.metrics.max_drawdown.to_string(),
            self.metrics.volatility.to_string(),
            self.metrics.rebalances.to_string(),
        ]
    }
}

/// Ordered collection of result rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    rows: Vec<ResultRow>,
}

impl ResultTable {
    pub fn new(rows: Vec<ResultRow>) -> Self {
        Self { rows }
    }

    /// Concatenate tables, preserving their order.
    pub fn concat(tables: impl IntoIterator<Item = ResultTable>) -> Self {
        Self {
            rows: tables.into_iter().flat_map(|t| t.rows).collect(),
        }
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<ResultRow> {
        self.rows
    }

    pub fn push(&mut self, row: ResultRow) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of distinct `Start Date` values.
    pub fn distinct_start_dates(&self) -> usize {
        let mut starts: Vec<DateTime<Utc>> = self.rows.iter().map(|r| r.start_date).collect();
        starts.sort();
        starts.dedup();
        starts.len()
    }

    /// Sort rows by CAGR, best first. The sort is stable so ties keep their
    /// evaluation order; NaN sorts last.
    pub fn sort_by_cagr_desc(&mut self) {
        self.rows.sort_by(|a, b| {
            let a = if a.cagr().is_nan() { f64::NEG_INFINITY } else { a.cagr() };
            let b = if b.cagr().is_nan() { f64::NEG_INFINITY } else { b.cagr() };
            b.total_cmp(&a)
        });
    }

    /// Consuming variant of [`sort_by_cagr_desc`](Self::sort_by_cagr_desc).
    pub fn ranked(mut self) -> Self {
        self.sort_by_cagr_desc();
        self
    }

    /// First row; after ranking, the best one.
    pub fn top(&self) -> Option<&ResultRow> {
        self.rows.first()
    }

    /// Write the table as CSV with a header row.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(COLUMNS)?;
        for row in &self.rows {
            wtr.write_record(row.csv_record())?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Save the table as a CSV file.
    pub fn save_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)?;
        self.write_csv(file)?;
        info!("Saved {} result rows to {}", self.len(), path.display());
        Ok(())
    }

    /// Serialize the table as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Text table of the first `n` rows.
    pub fn summary(&self, n: usize) -> String {
        let mut builder = Builder::new();
        builder.push_record([
            "Start", "End", "CAGR %", "Sharpe", "Max DD %", "Steps", "Proportions",
        ]);

        for row in self.rows.iter().take(n) {
            builder.push_record([
                row.start_date.format("%Y-%m-%d").to_string(),
                row.end_date.format("%Y-%m-%d").to_string(),
                format!("{:.2}", row.metrics.cagr * 100.0),
                format!("{:.2}", row.metrics.sharpe),
                format!("{:.2}", row.metrics.max_drawdown * 100.0),
                row.stepped_tests.to_string(),
                row.key.rebal_proportions.clone(),
            ]);
        }

        builder.build().with(Style::rounded()).to_string()
    }
}
