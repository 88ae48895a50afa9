//! Backtest evaluation of a single parameter combination.
//!
//! [`BacktestEvaluator`] is the boundary the optimizer and fan-out drive. Any
//! `Fn(&ParameterCombination) -> Result<ResultTable>` closure implements it,
//! which is convenient for scripted evaluators in tests. [`RebalanceEvaluator`]
//! is the built-in implementation: a periodic-rebalance (or buy-and-hold)
//! simulation on close prices.

use crate::error::{OptimizerError, Result};
use crate::results::{HashSpan, Metrics, ResultRow, ResultTable};
use crate::types::{AllocationVector, PriceHistorySet, StrategyKind};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

const SECONDS_PER_YEAR: f64 = 365.25 * 86_400.0;

/// Strategy parameters of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyKwargs {
    /// Target allocation, one weight per asset in ticker order.
    pub rebal_proportions: AllocationVector,
    /// Bars between rebalances; 0 disables rebalancing.
    pub rebal_interval: usize,
    /// Correlation id of the optimizer candidate, echoed into the result.
    pub candidate: Option<usize>,
}

impl StrategyKwargs {
    pub fn new(rebal_proportions: AllocationVector, rebal_interval: usize) -> Self {
        Self {
            rebal_proportions,
            rebal_interval,
            candidate: None,
        }
    }

    pub fn with_candidate(mut self, candidate: usize) -> Self {
        self.candidate = Some(candidate);
        self
    }
}

/// One element of the sweep cross product; one evaluator call.
#[derive(Debug, Clone)]
pub struct ParameterCombination<'a> {
    pub prices: &'a PriceHistorySet,
    pub strategy: StrategyKind,
    /// First window start; defaults to the first aligned bar.
    pub start: Option<DateTime<Utc>>,
    /// Last usable timestamp; defaults to the last aligned bar.
    pub end: Option<DateTime<Utc>>,
    /// Window length; `None` runs a single window from start to end.
    pub duration: Option<Duration>,
    /// Offset between successive window starts when `duration` is set.
    pub start_step: Option<Duration>,
    pub kwargs: StrategyKwargs,
}

/// Runs one backtest combination and returns one row per evaluated window.
pub trait BacktestEvaluator: Send + Sync {
    fn evaluate(&self, combination: &ParameterCombination<'_>) -> Result<ResultTable>;
}

impl<F> BacktestEvaluator for F
where
    F: Fn(&ParameterCombination<'_>) -> Result<ResultTable> + Send + Sync,
{
    fn evaluate(&self, combination: &ParameterCombination<'_>) -> Result<ResultTable> {
        self(combination)
    }
}

/// Settings of the built-in evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Portfolio value at the start of every window.
    #[serde(default = "default_starting_value")]
    pub starting_value: f64,
    /// Commission on traded notional, in percent (0.1 = 0.1%).
    #[serde(default)]
    pub commission_pct: f64,
    /// Periods per year used to annualize Sharpe and volatility.
    #[serde(default = "default_periods_per_year")]
    pub periods_per_year: f64,
}

fn default_starting_value() -> f64 {
    10_000.0
}

fn default_periods_per_year() -> f64 {
    252.0
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            starting_value: default_starting_value(),
            commission_pct: 0.0,
            periods_per_year: default_periods_per_year(),
        }
    }
}

impl EvaluatorConfig {
    /// Reject settings that would make every equity curve degenerate.
    pub fn validate(&self) -> Result<()> {
        if !(self.starting_value.is_finite() && self.starting_value > 0.0) {
            return Err(OptimizerError::Config(format!(
                "starting_value must be positive, got {}",
                self.starting_value
            )));
        }
        if !(self.commission_pct >= 0.0 && self.commission_pct < 100.0) {
            return Err(OptimizerError::Config(format!(
                "commission_pct must be in [0, 100), got {}",
                self.commission_pct
            )));
        }
        if !(self.periods_per_year.is_finite() && self.periods_per_year > 0.0) {
            return Err(OptimizerError::Config(format!(
                "periods_per_year must be positive, got {}",
                self.periods_per_year
            )));
        }
        Ok(())
    }
}

/// Close prices of every asset at one timestamp, in ticker order.
type AlignedRow = (DateTime<Utc>, Vec<f64>);

/// Periodic-rebalance backtest on close prices.
#[derive(Debug, Clone, Default)]
pub struct RebalanceEvaluator {
    config: EvaluatorConfig,
}

impl RebalanceEvaluator {
    pub fn new(config: EvaluatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Timestamps present for every asset, with their closes.
    fn align(prices: &PriceHistorySet) -> Vec<AlignedRow> {
        let n = prices.len();
        let mut by_time: BTreeMap<DateTime<Utc>, Vec<f64>> = BTreeMap::new();
        for (_, bars) in prices.iter() {
            for bar in bars {
                by_time.entry(bar.timestamp).or_default().push(bar.close);
            }
        }
        by_time.into_iter().filter(|(_, c)| c.len() == n).collect()
    }

    /// Resolve the list of `[start, end]` windows to simulate.
    fn windows(
        first: DateTime<Utc>,
        last: DateTime<Utc>,
        combination: &ParameterCombination<'_>,
    ) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
        let start = combination.start.map_or(first, |s| s.max(first));
        let end = combination.end.map_or(last, |e| e.min(last));
        if start >= end {
            return Err(OptimizerError::InputShape(format!(
                "empty date window {} .. {}",
                start, end
            )));
        }

        let Some(duration) = combination.duration else {
            return Ok(vec![(start, end)]);
        };
        if duration <= Duration::zero() {
            return Err(OptimizerError::Config(
                "duration must be positive".to_string(),
            ));
        }
        if let Some(step) = combination.start_step {
            if step <= Duration::zero() {
                return Err(OptimizerError::Config(
                    "start step must be positive".to_string(),
                ));
            }
        }

        let mut windows = Vec::new();
        let mut window_start = start;
        while window_start + duration <= end {
            windows.push((window_start, window_start + duration));
            match combination.start_step {
                Some(step) => window_start += step,
                None => break,
            }
        }

        if windows.is_empty() {
            return Err(OptimizerError::InputShape(format!(
                "history {} .. {} is shorter than the requested duration of {} days",
                start,
                end,
                duration.num_days()
            )));
        }
        Ok(windows)
    }

    /// Simulate one window, returning the equity curve and rebalance count.
    fn simulate(
        &self,
        rows: &[AlignedRow],
        weights: &[f64],
        strategy: StrategyKind,
        rebal_interval: usize,
    ) -> (Vec<f64>, usize) {
        let fee_rate = self.config.commission_pct / 100.0;
        let first_prices = &rows[0].1;
        let invested = self.config.starting_value * (1.0 - fee_rate);

        let mut holdings: Vec<f64> = weights
            .iter()
            .zip(first_prices)
            .map(|(w, p)| invested * w / p)
            .collect();
        let mut equity_curve = Vec::with_capacity(rows.len());
        equity_curve.push(invested);
        let mut rebalances = 0;

        let rebalancing = strategy == StrategyKind::Rebalance && rebal_interval > 0;

        for (k, (_, prices)) in rows.iter().enumerate().skip(1) {
            let mut equity: f64 = holdings.iter().zip(prices).map(|(h, p)| h * p).sum();

            if rebalancing && k % rebal_interval == 0 && k + 1 < rows.len() {
                let turnover: f64 = holdings
                    .iter()
                    .zip(prices)
                    .zip(weights)
                    .map(|((h, p), w)| (equity * w - h * p).abs())
                    .sum();
                equity -= turnover * fee_rate;
                holdings = weights
                    .iter()
                    .zip(prices)
                    .map(|(w, p)| equity * w / p)
                    .collect();
                rebalances += 1;
            }

            equity_curve.push(equity);
        }

        (equity_curve, rebalances)
    }

    fn metrics(&self, equity_curve: &[f64], years: f64, rebalances: usize) -> Metrics {
        let starting = self.config.starting_value;
        let ending = equity_curve.last().copied().unwrap_or(starting);
        let total_return = ending / starting - 1.0;

        let cagr = if ending <= 0.0 {
            -1.0
        } else if years > 0.0 {
            (ending / starting).powf(1.0 / years) - 1.0
        } else {
            0.0
        };

        let returns: Vec<f64> = equity_curve
            .windows(2)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();
        let (mean, std_dev) = mean_std(&returns);
        let annualization = self.config.periods_per_year.sqrt();
        let sharpe = if std_dev > 0.0 {
            mean / std_dev * annualization
        } else {
            0.0
        };

        Metrics {
            ending_value: ending,
            total_return,
            cagr,
            sharpe,
            max_drawdown: max_drawdown(equity_curve),
            volatility: std_dev * annualization,
            rebalances: rebalances as f64,
        }
    }
}

impl BacktestEvaluator for RebalanceEvaluator {
    fn evaluate(&self, combination: &ParameterCombination<'_>) -> Result<ResultTable> {
        let prices = combination.prices;
        let kwargs = &combination.kwargs;

        if prices.is_empty() {
            return Err(OptimizerError::InputShape(
                "price-history set has no assets".to_string(),
            ));
        }
        if kwargs.rebal_proportions.len() != prices.len() {
            return Err(OptimizerError::InputShape(format!(
                "allocation has {} weights for {} assets",
                kwargs.rebal_proportions.len(),
                prices.len()
            )));
        }

        let aligned = Self::align(prices);
        let (first, last) = match (aligned.first(), aligned.last()) {
            (Some(f), Some(l)) => (f.0, l.0),
            _ => {
                return Err(OptimizerError::InputShape(format!(
                    "no common timestamps across {}",
                    prices.label()
                )))
            }
        };

        let key = HashSpan {
            stocks: prices.label(),
            strategy: combination.strategy,
            candidate: kwargs.candidate,
            rebal_proportions: kwargs.rebal_proportions.to_string(),
            rebal_interval: kwargs.rebal_interval,
            starting_value: self.config.starting_value,
        };

        let mut table = ResultTable::default();
        for (window_start, window_end) in Self::windows(first, last, combination)? {
            let lo = aligned.partition_point(|(t, _)| *t < window_start);
            let hi = aligned.partition_point(|(t, _)| *t <= window_end);
            let rows = &aligned[lo..hi];
            if rows.len() < 2 {
                return Err(OptimizerError::InputShape(format!(
                    "window {} .. {} holds fewer than two common bars",
                    window_start, window_end
                )));
            }

            let (equity_curve, rebalances) = self.simulate(
                rows,
                kwargs.rebal_proportions.weights(),
                combination.strategy,
                kwargs.rebal_interval,
            );

            let start_date = rows[0].0;
            let end_date = rows[rows.len() - 1].0;
            let duration_secs = (end_date - start_date).num_seconds();
            let years = duration_secs as f64 / SECONDS_PER_YEAR;
            let metrics = self.metrics(&equity_curve, years, rebalances);

            debug!(
                "{} {} {}..{}: CAGR {:.4}",
                key.stocks, key.rebal_proportions, start_date, end_date, metrics.cagr
            );

            table.push(ResultRow {
                start_date,
                end_date,
                duration_secs,
                key: key.clone(),
                stepped_tests: 1,
                metrics,
            });
        }

        Ok(table)
    }
}

/// Population mean and standard deviation.
fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Largest peak-to-trough decline as a fraction of the peak.
fn max_drawdown(equity_curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for &value in equity_curve {
        peak = peak.max(value);
        if peak > 0.0 {
            worst = worst.max((peak - value) / peak);
        }
    }
    worst
}
