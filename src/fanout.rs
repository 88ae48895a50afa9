//! Parallel evaluation of a sweep cross product.
//!
//! A [`SweepSpace`] lists every value of every sweep dimension. Its cross
//! product is evaluated on a rayon pool by [`FanOut`]; results are collected
//! in combination order and concatenated into one [`ResultTable`]. Any failed
//! evaluation fails the whole batch.

use crate::error::{OptimizerError, Result};
use crate::evaluator::{BacktestEvaluator, ParameterCombination, StrategyKwargs};
use crate::results::ResultTable;
use crate::types::{PriceHistorySet, StrategyKind};
use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use std::time::Instant;
use tracing::debug;

/// Every value of every sweep dimension.
///
/// The cross product varies `kwargs` fastest and `price_sets` slowest.
#[derive(Debug, Clone)]
pub struct SweepSpace<'a> {
    pub price_sets: Vec<&'a PriceHistorySet>,
    pub strategies: Vec<StrategyKind>,
    pub starts: Vec<Option<DateTime<Utc>>>,
    pub ends: Vec<Option<DateTime<Utc>>>,
    pub durations: Vec<Option<Duration>>,
    pub start_steps: Vec<Option<Duration>>,
    pub kwargs: Vec<StrategyKwargs>,
}

impl<'a> SweepSpace<'a> {
    /// Sweep over the given sets and kwargs with a single full-range window.
    pub fn new(price_sets: Vec<&'a PriceHistorySet>, kwargs: Vec<StrategyKwargs>) -> Self {
        Self {
            price_sets,
            strategies: vec![StrategyKind::Rebalance],
            starts: vec![None],
            ends: vec![None],
            durations: vec![None],
            start_steps: vec![None],
            kwargs,
        }
    }

    /// Number of combinations in the cross product.
    pub fn len(&self) -> usize {
        self.price_sets.len()
            * self.strategies.len()
            * self.starts.len()
            * self.ends.len()
            * self.durations.len()
            * self.start_steps.len()
            * self.kwargs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialize the cross product.
    pub fn combinations(&self) -> Vec<ParameterCombination<'a>> {
        let mut out = Vec::with_capacity(self.len());
        for &prices in &self.price_sets {
            for &strategy in &self.strategies {
                for &start in &self.starts {
                    for &end in &self.ends {
                        for &duration in &self.durations {
                            for &start_step in &self.start_steps {
                                for kwargs in &self.kwargs {
                                    out.push(ParameterCombination {
                                        prices,
                                        strategy,
                                        start,
                                        end,
                                        duration,
                                        start_step,
                                        kwargs: kwargs.clone(),
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
        out
    }
}

/// Time limit for one fan-out batch.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    iteration: usize,
    started: Instant,
    limit: std::time::Duration,
}

impl Deadline {
    /// Deadline starting now.
    pub fn new(iteration: usize, limit: std::time::Duration) -> Self {
        Self {
            iteration,
            started: Instant::now(),
            limit,
        }
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() > self.limit
    }

    fn error(&self) -> OptimizerError {
        OptimizerError::IterationTimeout {
            iteration: self.iteration,
            elapsed_ms: self.started.elapsed().as_millis(),
        }
    }
}

/// Executor for sweep batches.
pub struct FanOut {
    parallel: bool,
    pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for FanOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOut")
            .field("parallel", &self.parallel)
            .field(
                "threads",
                &self.pool.as_ref().map(|p| p.current_num_threads()),
            )
            .finish()
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self {
            parallel: true,
            pool: None,
        }
    }
}

impl FanOut {
    /// Create an executor. With `threads` set, a dedicated rayon pool of that
    /// size is built; otherwise the global pool is used.
    pub fn new(parallel: bool, threads: Option<usize>) -> Result<Self> {
        let pool = match threads {
            Some(n) if parallel => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| OptimizerError::Config(format!("thread pool: {}", e)))?,
            ),
            _ => None,
        };
        Ok(Self { parallel, pool })
    }

    /// Executor that evaluates combinations one after another.
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            pool: None,
        }
    }

    /// Evaluate every combination and concatenate the results in order.
    ///
    /// Workers that have not started when `deadline` expires fail with
    /// [`OptimizerError::IterationTimeout`]; the batch also fails if the
    /// deadline has passed once every worker has finished.
    pub fn evaluate<E>(
        &self,
        evaluator: &E,
        combinations: &[ParameterCombination<'_>],
        deadline: Option<&Deadline>,
    ) -> Result<ResultTable>
    where
        E: BacktestEvaluator + ?Sized,
    {
        let started = Instant::now();

        let run_one = |combination: &ParameterCombination<'_>| -> Result<ResultTable> {
            if let Some(d) = deadline {
                if d.expired() {
                    return Err(d.error());
                }
            }
            evaluator.evaluate(combination)
        };

        let tables: Vec<ResultTable> = if self.parallel {
            let run_all = || combinations.par_iter().map(run_one).collect::<Result<Vec<_>>>();
            match &self.pool {
                Some(pool) => pool.install(run_all)?,
                None => run_all()?,
            }
        } else {
            combinations.iter().map(run_one).collect::<Result<Vec<_>>>()?
        };

        if let Some(d) = deadline {
            if d.expired() {
                return Err(d.error());
            }
        }

        let table = ResultTable::concat(tables);
        debug!(
            "Evaluated {} combinations into {} rows in {:?}",
            combinations.len(),
            table.len(),
            started.elapsed()
        );
        Ok(table)
    }

    /// Evaluate the full cross product of `space`.
    pub fn evaluate_space<E>(
        &self,
        evaluator: &E,
        space: &SweepSpace<'_>,
        deadline: Option<&Deadline>,
    ) -> Result<ResultTable>
    where
        E: BacktestEvaluator + ?Sized,
    {
        self.evaluate(evaluator, &space.combinations(), deadline)
    }
}
