//! Coordinate-ascent search over rebalance proportions.
//!
//! The optimizer keeps one un-normalized integer weight per asset
//! (`best_ratios`, starting at `round(1 / initial_step)` units each). Every
//! iteration it:
//!
//! 1. computes the step size `max(initial_step * min_step_fraction,
//!    decay_rate ^ iteration)`;
//! 2. builds one candidate per asset by adding `round(sum * step)` units to
//!    that asset and normalizing;
//! 3. backtests the cross product of every sweep dimension with every
//!    candidate through a [`FanOut`];
//! 4. averages stepped runs when the batch spans several start dates;
//! 5. ranks by CAGR and adds the same number of units to the winning asset.
//!
//! The iteration count is fixed; there is no convergence test. The update only
//! ever grows the winning coordinate.
//!
//! # Example
//!
//! ```no_run
//! use rebalance_optimizer::evaluator::RebalanceEvaluator;
//! use rebalance_optimizer::optimizer::{OptimizationInput, OptimizerConfig, RebalanceOptimizer};
//! use rebalance_optimizer::types::PriceHistorySet;
//!
//! # fn main() -> rebalance_optimizer::Result<()> {
//! let prices: PriceHistorySet = unimplemented!();
//! let input = OptimizationInput::single(prices).with_rebal_interval(21);
//!
//! let mut optimizer =
//!     RebalanceOptimizer::new(OptimizerConfig::default(), RebalanceEvaluator::default())?;
//! let outcome = optimizer.run(&input)?;
//! println!("Best proportions: {}", outcome.best_allocation);
//! # Ok(())
//! # }
//! ```

use crate::aggregate::average_stepped;
use crate::data::truncate_to_common_window;
use crate::error::{OptimizerError, Result};
use crate::evaluator::{BacktestEvaluator, StrategyKwargs};
use crate::fanout::{Deadline, FanOut, SweepSpace};
use crate::metadata::{compute_config_hash, generate_run_id};
use crate::results::ResultTable;
use crate::types::{AllocationVector, PriceHistorySet, StrategyKind};
use chrono::{DateTime, Duration, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Rebalance interval used when the input names none.
pub const DEFAULT_REBAL_INTERVAL: usize = 21;

/// Search schedule and execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Number of iterations to run.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Base step; the initial weight of every asset is `round(1 / initial_step)` units.
    #[serde(default = "default_initial_step")]
    pub initial_step: f64,
    /// Per-iteration decay of the step size.
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
    /// Floor of the step size as a fraction of `initial_step`.
    #[serde(default = "default_min_step_fraction")]
    pub min_step_fraction: f64,
    /// Evaluate candidates in parallel.
    #[serde(default = "default_true")]
    pub parallel: bool,
    /// Worker threads; the global rayon pool is used when unset.
    #[serde(default)]
    pub threads: Option<usize>,
    /// Maximum wall-clock seconds for one iteration's batch.
    #[serde(default)]
    pub iteration_timeout_secs: Option<f64>,
    /// Wall-clock budget for the whole run, checked between iterations.
    #[serde(default)]
    pub time_budget_secs: Option<f64>,
    /// Show a progress bar over iterations.
    #[serde(default)]
    pub show_progress: bool,
}

fn default_iterations() -> usize {
    1000
}
fn default_initial_step() -> f64 {
    0.01
}
fn default_decay_rate() -> f64 {
    0.93
}
fn default_min_step_fraction() -> f64 {
    0.1
}
fn default_true() -> bool {
    true
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            initial_step: default_initial_step(),
            decay_rate: default_decay_rate(),
            min_step_fraction: default_min_step_fraction(),
            parallel: true,
            threads: None,
            iteration_timeout_secs: None,
            time_budget_secs: None,
            show_progress: false,
        }
    }
}

impl OptimizerConfig {
    /// Check ranges of every setting.
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(OptimizerError::Config(
                "iterations must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("initial_step", self.initial_step),
            ("decay_rate", self.decay_rate),
            ("min_step_fraction", self.min_step_fraction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(OptimizerError::Config(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        for (name, value) in [
            ("iteration_timeout_secs", self.iteration_timeout_secs),
            ("time_budget_secs", self.time_budget_secs),
        ] {
            if let Some(v) = value {
                if std::time::Duration::try_from_secs_f64(v).is_err() {
                    return Err(OptimizerError::Config(format!(
                        "{} must be a non-negative number of seconds, got {}",
                        name, v
                    )));
                }
            }
        }
        if self.threads == Some(0) {
            return Err(OptimizerError::Config("threads must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Initial un-normalized weight of every asset.
    pub fn initial_units(&self) -> u64 {
        (1.0 / self.initial_step).round_ties_even() as u64
    }

    /// Step size at `iteration`: exponential decay with a floor.
    pub fn step_size(&self, iteration: usize) -> f64 {
        let floor = self.initial_step * self.min_step_fraction;
        let decayed = self.decay_rate.powi(iteration.min(i32::MAX as usize) as i32);
        floor.max(decayed)
    }

    fn iteration_timeout(&self) -> Option<std::time::Duration> {
        self.iteration_timeout_secs
            .and_then(|s| std::time::Duration::try_from_secs_f64(s).ok())
    }

    fn time_budget(&self) -> Option<std::time::Duration> {
        self.time_budget_secs
            .and_then(|s| std::time::Duration::try_from_secs_f64(s).ok())
    }
}

/// Sweep inputs of an optimization run. Every dimension is a sequence; the
/// `with_*` builders set a single value, the plural variants a list.
#[derive(Debug, Clone)]
pub struct OptimizationInput {
    pub price_sets: Vec<PriceHistorySet>,
    pub strategies: Vec<StrategyKind>,
    pub starts: Vec<Option<DateTime<Utc>>>,
    pub ends: Vec<Option<DateTime<Utc>>>,
    pub durations: Vec<Option<Duration>>,
    pub start_steps: Vec<Option<Duration>>,
    /// Only the first interval is used by the optimizer.
    pub rebal_intervals: Vec<usize>,
}

impl OptimizationInput {
    pub fn new(price_sets: Vec<PriceHistorySet>) -> Self {
        Self {
            price_sets,
            strategies: vec![StrategyKind::Rebalance],
            starts: vec![None],
            ends: vec![None],
            durations: vec![None],
            start_steps: vec![None],
            rebal_intervals: vec![DEFAULT_REBAL_INTERVAL],
        }
    }

    /// Input over a single price-history set.
    pub fn single(prices: PriceHistorySet) -> Self {
        Self::new(vec![prices])
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategies = vec![strategy];
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<StrategyKind>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.starts = vec![Some(start)];
        self
    }

    pub fn with_starts(mut self, starts: Vec<Option<DateTime<Utc>>>) -> Self {
        self.starts = starts;
        self
    }

    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.ends = vec![Some(end)];
        self
    }

    pub fn with_ends(mut self, ends: Vec<Option<DateTime<Utc>>>) -> Self {
        self.ends = ends;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.durations = vec![Some(duration)];
        self
    }

    pub fn with_durations(mut self, durations: Vec<Option<Duration>>) -> Self {
        self.durations = durations;
        self
    }

    pub fn with_start_step(mut self, step: Duration) -> Self {
        self.start_steps = vec![Some(step)];
        self
    }

    pub fn with_start_steps(mut self, steps: Vec<Option<Duration>>) -> Self {
        self.start_steps = steps;
        self
    }

    pub fn with_rebal_interval(mut self, interval: usize) -> Self {
        self.rebal_intervals = vec![interval];
        self
    }

    pub fn with_rebal_intervals(mut self, intervals: Vec<usize>) -> Self {
        self.rebal_intervals = intervals;
        self
    }

    /// Number of assets shared by every price-history set.
    pub fn n_stocks(&self) -> Result<usize> {
        let first = self.price_sets.first().ok_or_else(|| {
            OptimizerError::InputShape("no price-history sets supplied".to_string())
        })?;
        let n = first.len();
        if n == 0 {
            return Err(OptimizerError::InputShape(
                "price-history set has no assets".to_string(),
            ));
        }
        if let Some((i, set)) = self
            .price_sets
            .iter()
            .enumerate()
            .find(|(_, s)| s.len() != n)
        {
            return Err(OptimizerError::InputShape(format!(
                "price-history set {} has {} assets, expected {}",
                i,
                set.len(),
                n
            )));
        }
        Ok(n)
    }

    /// Validate the sweep and truncate every history to the common window.
    pub fn prepare(&self) -> Result<Vec<PriceHistorySet>> {
        self.n_stocks()?;
        for (name, len) in [
            ("strategies", self.strategies.len()),
            ("starts", self.starts.len()),
            ("ends", self.ends.len()),
            ("durations", self.durations.len()),
            ("start_steps", self.start_steps.len()),
        ] {
            if len == 0 {
                return Err(OptimizerError::Config(format!(
                    "sweep dimension '{}' is empty",
                    name
                )));
            }
        }
        truncate_to_common_window(&self.price_sets)
    }

    fn rebal_interval(&self) -> usize {
        self.rebal_intervals
            .first()
            .copied()
            .unwrap_or(DEFAULT_REBAL_INTERVAL)
    }
}

/// One perturbed allocation considered in an iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Index of the asset that received the perturbation.
    pub id: usize,
    pub allocation: AllocationVector,
}

/// Build one candidate per asset: add `bump` units to that asset, normalize.
///
/// Returns the bump (`round(sum * step)`, ties to even) with the candidates.
///
/// Fails with [`OptimizerError::WeightOverflow`] when the total or any
/// perturbed weight no longer fits in a `u64`.
pub fn build_candidates(units: &[u64], step: f64) -> Result<(u64, Vec<Candidate>)> {
    let total = units
        .iter()
        .try_fold(0u64, |acc, &u| acc.checked_add(u))
        .ok_or_else(|| overflow(units))?;
    let bump = bump_units(total, step).ok_or_else(|| overflow(units))?;
    total.checked_add(bump).ok_or_else(|| overflow(units))?;

    let candidates = (0..units.len())
        .map(|id| {
            let mut perturbed = units.to_vec();
            perturbed[id] = perturbed[id]
                .checked_add(bump)
                .ok_or_else(|| overflow(units))?;
            AllocationVector::from_units(&perturbed)
                .map(|allocation| Candidate { id, allocation })
                .ok_or_else(|| {
                    OptimizerError::InputShape("allocation units sum to zero".to_string())
                })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((bump, candidates))
}

/// `round(total * step)`, ties to even, or `None` if it does not fit in a `u64`.
fn bump_units(total: u64, step: f64) -> Option<u64> {
    let raw = (total as f64 * step).round_ties_even();
    // u64::MAX as f64 rounds up to 2^64, which is itself out of range.
    if raw.is_finite() && raw >= 0.0 && raw < u64::MAX as f64 {
        Some(raw as u64)
    } else {
        None
    }
}

fn overflow(units: &[u64]) -> OptimizerError {
    OptimizerError::WeightOverflow(format!(
        "weights {:?} cannot grow further; lower decay_rate or iterations",
        units
    ))
}

/// What happened in one iteration.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub iteration: usize,
    pub step_size: f64,
    /// Units added to the winning asset.
    pub bump: u64,
    /// Index of the winning asset.
    pub winner: usize,
    /// Whether stepped runs were averaged.
    pub averaged: bool,
    /// Ranked (possibly averaged) results.
    pub table: ResultTable,
}

/// Result of a full optimization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Optimization {
    pub run_id: Uuid,
    pub config_hash: String,
    /// Ranked results of the final iteration.
    pub table: ResultTable,
    /// Final un-normalized weights.
    pub best_ratios: Vec<u64>,
    /// Final weights, normalized.
    pub best_allocation: AllocationVector,
    pub iterations_run: usize,
    /// Set when the time budget ended the run before the configured count.
    pub stopped_early: bool,
    pub elapsed_secs: f64,
}

/// Coordinate-ascent optimizer over rebalance proportions.
pub struct RebalanceOptimizer<E> {
    config: OptimizerConfig,
    evaluator: E,
    fan_out: FanOut,
    best_ratios: Vec<u64>,
}

impl<E: BacktestEvaluator> RebalanceOptimizer<E> {
    /// Create an optimizer; the fan-out follows `config.parallel` and
    /// `config.threads`.
    pub fn new(config: OptimizerConfig, evaluator: E) -> Result<Self> {
        config.validate()?;
        let fan_out = FanOut::new(config.parallel, config.threads)?;
        Ok(Self {
            config,
            evaluator,
            fan_out,
            best_ratios: Vec::new(),
        })
    }

    /// Replace the executor.
    pub fn with_fan_out(mut self, fan_out: FanOut) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    /// Current un-normalized weights.
    pub fn best_ratios(&self) -> &[u64] {
        &self.best_ratios
    }

    /// Current weights, normalized.
    pub fn best_allocation(&self) -> Option<AllocationVector> {
        AllocationVector::from_units(&self.best_ratios)
    }

    /// Reset to equal weighting over `n_stocks` assets.
    pub fn reset(&mut self, n_stocks: usize) {
        self.best_ratios = vec![self.config.initial_units(); n_stocks];
    }

    /// Candidates for `iteration` from the current state.
    pub fn candidates(&self, iteration: usize) -> Result<(u64, Vec<Candidate>)> {
        build_candidates(&self.best_ratios, self.config.step_size(iteration))
    }

    /// Run one iteration against already-truncated price sets.
    ///
    /// The state must have been [`reset`](Self::reset) to the sets' asset
    /// count.
    pub fn step(
        &mut self,
        iteration: usize,
        price_sets: &[PriceHistorySet],
        input: &OptimizationInput,
    ) -> Result<IterationOutcome> {
        let n_stocks = self.best_ratios.len();
        if n_stocks == 0 {
            return Err(OptimizerError::InputShape(
                "optimizer has no assets; call reset first".to_string(),
            ));
        }
        if let Some(set) = price_sets.iter().find(|s| s.len() != n_stocks) {
            return Err(OptimizerError::InputShape(format!(
                "price-history set has {} assets, optimizer tracks {}",
                set.len(),
                n_stocks
            )));
        }

        let step_size = self.config.step_size(iteration);
        let (bump, candidates) = build_candidates(&self.best_ratios, step_size)?;

        let interval = input.rebal_interval();
        let kwargs: Vec<StrategyKwargs> = candidates
            .iter()
            .map(|c| StrategyKwargs::new(c.allocation.clone(), interval).with_candidate(c.id))
            .collect();

        let space = SweepSpace {
            price_sets: price_sets.iter().collect(),
            strategies: input.strategies.clone(),
            starts: input.starts.clone(),
            ends: input.ends.clone(),
            durations: input.durations.clone(),
            start_steps: input.start_steps.clone(),
            kwargs,
        };

        let deadline = self
            .config
            .iteration_timeout()
            .map(|limit| Deadline::new(iteration, limit));
        let table = self
            .fan_out
            .evaluate_space(&self.evaluator, &space, deadline.as_ref())?;

        let averaged = table.distinct_start_dates() > 1;
        let table = if averaged {
            average_stepped(&table)
        } else {
            table
        }
        .ranked();

        let top = table.top().ok_or_else(|| {
            OptimizerError::CandidateMatch(format!("iteration {} produced no results", iteration))
        })?;
        let winner = top
            .key
            .candidate
            .filter(|id| *id < candidates.len())
            .ok_or_else(|| {
                OptimizerError::CandidateMatch(format!(
                    "top row {} does not identify a candidate of iteration {}",
                    top.key.rebal_proportions, iteration
                ))
            })?;

        debug!(
            "Iteration {}: step {:.4}, winner {} {} (CAGR {:.4})",
            iteration, step_size, winner, candidates[winner].allocation, top.metrics.cagr
        );

        let updated = self.best_ratios[winner]
            .checked_add(bump)
            .ok_or_else(|| overflow(&self.best_ratios))?;
        self.best_ratios[winner] = updated;

        Ok(IterationOutcome {
            iteration,
            step_size,
            bump,
            winner,
            averaged,
            table,
        })
    }

    /// Run the full search and return the final iteration's ranked results.
    pub fn run(&mut self, input: &OptimizationInput) -> Result<Optimization> {
        let started = Instant::now();
        let n_stocks = input.n_stocks()?;
        let price_sets = input.prepare()?;
        self.reset(n_stocks);

        info!(
            "Optimizing proportions of {} assets over {} price sets: {} iterations",
            n_stocks,
            price_sets.len(),
            self.config.iterations
        );

        let progress = self.progress_bar();
        let budget = self.config.time_budget();
        let mut last: Option<IterationOutcome> = None;
        let mut stopped_early = false;

        for iteration in 0..self.config.iterations {
            if let Some(limit) = budget {
                if iteration > 0 && started.elapsed() > limit {
                    warn!(
                        "Time budget of {:?} exhausted after {} iterations",
                        limit, iteration
                    );
                    stopped_early = true;
                    break;
                }
            }

            let outcome = self.step(iteration, &price_sets, input)?;
            if let Some(pb) = &progress {
                pb.inc(1);
            }
            last = Some(outcome);
        }

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        let last = last.ok_or(OptimizerError::NoData)?;
        let best_allocation = self.best_allocation().ok_or_else(|| {
            OptimizerError::InputShape("allocation units sum to zero".to_string())
        })?;

        info!(
            "Optimization finished after {} iterations: best proportions {}",
            last.iteration + 1,
            best_allocation
        );

        Ok(Optimization {
            run_id: generate_run_id(),
            config_hash: compute_config_hash(&self.config),
            table: last.table,
            best_ratios: self.best_ratios.clone(),
            best_allocation,
            iterations_run: last.iteration + 1,
            stopped_early,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    fn progress_bar(&self) -> Option<ProgressBar> {
        if !self.config.show_progress {
            return None;
        }
        let pb = ProgressBar::new(self.config.iterations as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        Some(pb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{ParameterCombination, RebalanceEvaluator};
    use crate::results::{HashSpan, Metrics, ResultRow};
    use crate::types::Bar;
    use chrono::TimeZone;

    fn day(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap() + Duration::days(i)
    }

    fn prices(n_assets: usize, days: i64) -> PriceHistorySet {
        let mut set = PriceHistorySet::new();
        for a in 0..n_assets {
            let drift = 1.0 + 0.0005 * (a as f64 + 1.0);
            let bars = (0..days)
                .map(|i| {
                    let wobble = (i as f64 * 0.3 + a as f64).sin() * 0.5;
                    Bar::from_close(day(i), 100.0 * drift.powi(i as i32) + wobble)
                })
                .collect();
            set.insert(format!("S{}", a), bars);
        }
        set
    }

    fn config(iterations: usize) -> OptimizerConfig {
        OptimizerConfig {
            iterations,
            ..Default::default()
        }
    }

    fn scripted<F>(f: F) -> F
    where
        F: Fn(&ParameterCombination<'_>) -> Result<ResultTable> + Send + Sync,
    {
        f
    }

    fn row_for(c: &ParameterCombination<'_>, start: DateTime<Utc>, cagr: f64) -> ResultRow {
        ResultRow {
            start_date: start,
            end_date: start + Duration::days(30),
            duration_secs: Duration::days(30).num_seconds(),
            key: HashSpan {
                stocks: c.prices.label(),
                strategy: c.strategy,
                candidate: c.kwargs.candidate,
                rebal_proportions: c.kwargs.rebal_proportions.to_string(),
                rebal_interval: c.kwargs.rebal_interval,
                starting_value: 1.0,
            },
            stepped_tests: 1,
            metrics: Metrics {
                cagr,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_default_schedule() {
        let config = OptimizerConfig::default();
        assert_eq!(config.iterations, 1000);
        assert_eq!(config.initial_units(), 100);
        assert_eq!(config.step_size(0), 1.0);
        assert!((config.step_size(1) - 0.93).abs() < 1e-12);
        assert!((config.step_size(999) - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_step_size_decays_to_floor() {
        let config = OptimizerConfig::default();
        let mut prev = f64::INFINITY;
        for i in 0..2000 {
            let s = config.step_size(i);
            assert!(s <= prev);
            assert!(s >= 0.001 - 1e-15);
            prev = s;
        }
    }

    #[test]
    fn test_candidates_per_asset() {
        let (bump, candidates) = build_candidates(&[100, 100, 100], 0.5).unwrap();
        assert_eq!(bump, 150);
        assert_eq!(candidates.len(), 3);
        for (i, c) in candidates.iter().enumerate() {
            assert_eq!(c.id, i);
            assert!((c.allocation.sum() - 1.0).abs() < 1e-6);
            assert!((c.allocation.weights()[i] - 250.0 / 450.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_bump_rounds_half_to_even() {
        let (bump, _) = build_candidates(&[1, 1, 1, 1, 1], 0.5).unwrap();
        assert_eq!(bump, 2);
        let (bump, _) = build_candidates(&[1, 1, 1, 1, 1, 1, 1], 0.5).unwrap();
        assert_eq!(bump, 4);
    }

    #[test]
    fn test_single_candidate_for_single_asset() {
        let (_, candidates) = build_candidates(&[100], 0.3).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].allocation.to_string(), "[1.0]");
    }

    #[test]
    fn test_winning_asset_receives_bump() {
        let set = prices(2, 40);
        let input = OptimizationInput::single(set);
        let evaluator = scripted(|c| {
            let cagr = if c.kwargs.rebal_proportions.to_string() == "[0.75, 0.25]" {
                0.2
            } else {
                0.1
            };
            Ok(ResultTable::new(vec![row_for(c, day(0), cagr)]))
        });

        let mut optimizer = RebalanceOptimizer::new(config(1), evaluator).unwrap();
        let outcome = optimizer.run(&input).unwrap();

        // Iteration 0 uses a step of 1.0: bump = round(200 * 1.0).
        assert_eq!(outcome.best_ratios, vec![300, 100]);
        assert_eq!(optimizer.best_ratios(), &[300, 100]);
        assert_eq!(outcome.iterations_run, 1);
        assert!(!outcome.stopped_early);
        assert_eq!(outcome.table.len(), 2);
        assert_eq!(outcome.table.top().unwrap().key.candidate, Some(0));
    }

    #[test]
    fn test_step_updates_only_winner() {
        let set = prices(3, 40);
        let input = OptimizationInput::single(set.clone());
        let evaluator = scripted(|c| {
            let cagr = if c.kwargs.candidate == Some(2) { 0.5 } else { 0.0 };
            Ok(ResultTable::new(vec![row_for(c, day(0), cagr)]))
        });

        let mut optimizer = RebalanceOptimizer::new(config(10), evaluator).unwrap();
        optimizer.reset(3);
        let outcome = optimizer.step(4, &[set], &input).unwrap();

        let expected = (300.0 * 0.93_f64.powi(4)).round_ties_even() as u64;
        assert_eq!(outcome.bump, expected);
        assert_eq!(outcome.winner, 2);
        assert_eq!(optimizer.best_ratios(), &[100, 100, 100 + expected]);
    }

    #[test]
    fn test_single_asset_run() {
        let input = OptimizationInput::single(prices(1, 60)).with_rebal_interval(5);
        let mut optimizer =
            RebalanceOptimizer::new(config(5), RebalanceEvaluator::default()).unwrap();

        let outcome = optimizer.run(&input).unwrap();
        assert_eq!(outcome.table.len(), 1);
        assert_eq!(outcome.table.rows()[0].key.rebal_proportions, "[1.0]");
        assert_eq!(outcome.best_allocation.weights(), &[1.0]);
    }

    #[test]
    fn test_stepped_runs_are_averaged() {
        let input = OptimizationInput::single(prices(2, 200))
            .with_duration(Duration::days(100))
            .with_start_step(Duration::days(30));
        let mut optimizer =
            RebalanceOptimizer::new(config(2), RebalanceEvaluator::default()).unwrap();
        optimizer.reset(2);

        let sets = input.prepare().unwrap();
        let outcome = optimizer.step(0, &sets, &input).unwrap();
        assert!(outcome.averaged);
        assert_eq!(outcome.table.len(), 2);
        // Windows start on days 0, 30, 60 and 90.
        assert!(outcome.table.rows().iter().all(|r| r.stepped_tests == 4));
    }

    #[test]
    fn test_missing_candidate_id_is_fatal() {
        let input = OptimizationInput::single(prices(2, 20));
        let evaluator = scripted(|c| {
            let mut row = row_for(c, day(0), 0.1);
            row.key.candidate = None;
            Ok(ResultTable::new(vec![row]))
        });

        let mut optimizer = RebalanceOptimizer::new(config(3), evaluator).unwrap();
        let err = optimizer.run(&input).unwrap_err();
        assert!(matches!(err, OptimizerError::CandidateMatch(_)));
    }

    #[test]
    fn test_evaluation_failure_aborts_run() {
        let input = OptimizationInput::single(prices(2, 20));
        let evaluator = scripted(|_| Err(OptimizerError::Evaluation("bad data".to_string())));

        let mut optimizer = RebalanceOptimizer::new(config(3), evaluator).unwrap();
        assert!(matches!(
            optimizer.run(&input),
            Err(OptimizerError::Evaluation(_))
        ));
    }

    #[test]
    fn test_input_shape_errors() {
        let evaluator = RebalanceEvaluator::default();
        let mut optimizer = RebalanceOptimizer::new(config(1), evaluator).unwrap();

        let empty = OptimizationInput::new(vec![]);
        assert!(matches!(
            optimizer.run(&empty),
            Err(OptimizerError::InputShape(_))
        ));

        let no_assets = OptimizationInput::single(PriceHistorySet::new());
        assert!(matches!(
            optimizer.run(&no_assets),
            Err(OptimizerError::InputShape(_))
        ));

        let mismatched = OptimizationInput::new(vec![prices(2, 20), prices(3, 20)]);
        assert!(matches!(
            optimizer.run(&mismatched),
            Err(OptimizerError::InputShape(_))
        ));
    }

    #[test]
    fn test_time_budget_stops_after_first_iteration() {
        let input = OptimizationInput::single(prices(2, 30));
        let mut cfg = config(50);
        cfg.time_budget_secs = Some(0.0);
        let mut optimizer = RebalanceOptimizer::new(cfg, RebalanceEvaluator::default()).unwrap();

        let outcome = optimizer.run(&input).unwrap();
        assert_eq!(outcome.iterations_run, 1);
        assert!(outcome.stopped_early);
    }

    #[test]
    fn test_slow_decay_reports_weight_overflow() {
        let input = OptimizationInput::single(prices(2, 20));
        let evaluator = scripted(|c| {
            let cagr = if c.kwargs.candidate == Some(0) { 0.3 } else { 0.1 };
            Ok(ResultTable::new(vec![row_for(c, day(0), cagr)]))
        });
        let cfg = OptimizerConfig {
            iterations: 1000,
            decay_rate: 0.99,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());

        let mut optimizer = RebalanceOptimizer::new(cfg, evaluator).unwrap();
        let err = optimizer.run(&input).unwrap_err();
        assert!(matches!(err, OptimizerError::WeightOverflow(_)));

        // The last committed state is still a valid allocation.
        let ratios = optimizer.best_ratios();
        assert!(ratios[0] > ratios[1]);
        assert_eq!(ratios[1], 100);
        assert!(ratios.iter().try_fold(0u64, |a, &r| a.checked_add(r)).is_some());
    }

    #[test]
    fn test_candidates_near_u64_limit() {
        let err = build_candidates(&[u64::MAX - 10, 5], 0.5).unwrap_err();
        assert!(matches!(err, OptimizerError::WeightOverflow(_)));
        let err = build_candidates(&[u64::MAX / 2, u64::MAX / 2], 0.5).unwrap_err();
        assert!(matches!(err, OptimizerError::WeightOverflow(_)));
    }

    #[test]
    fn test_unrepresentable_time_limits_rejected() {
        for secs in [1e30, -1.0, f64::NAN, f64::INFINITY] {
            let cfg = OptimizerConfig {
                time_budget_secs: Some(secs),
                ..Default::default()
            };
            assert!(matches!(cfg.validate(), Err(OptimizerError::Config(_))));

            let cfg = OptimizerConfig {
                iteration_timeout_secs: Some(secs),
                ..Default::default()
            };
            assert!(matches!(cfg.validate(), Err(OptimizerError::Config(_))));
        }

        let cfg = OptimizerConfig {
            time_budget_secs: Some(3600.0),
            iteration_timeout_secs: Some(0.0),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = OptimizerConfig {
            decay_rate: 1.5,
            ..Default::default()
        };
        assert!(RebalanceOptimizer::new(bad, RebalanceEvaluator::default()).is_err());

        let bad = OptimizerConfig {
            iterations: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
