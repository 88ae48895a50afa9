//! Rebalance optimizer - coordinate-ascent search over portfolio proportions.
//!
//! # Overview
//!
//! Given one or more sets of aligned price histories, the optimizer looks for
//! the fixed allocation that maximizes CAGR under a periodic-rebalance
//! strategy. Each iteration perturbs every asset's weight in turn, backtests
//! every perturbation in parallel and moves the running estimate toward the
//! best one with a decaying step.
//!
//! - **Parallel evaluation**: every iteration's sweep runs on a rayon pool
//! - **Stepped windows**: runs from several start dates are averaged before ranking
//! - **Pluggable backtests**: anything implementing [`BacktestEvaluator`] can drive the search
//! - **Configuration files**: TOML-based configuration for reproducible runs
//!
//! # Quick Start
//!
//! ```no_run
//! use rebalance_optimizer::{
//!     data::{load_dir, DataConfig},
//!     evaluator::RebalanceEvaluator,
//!     optimizer::{OptimizationInput, OptimizerConfig, RebalanceOptimizer},
//! };
//!
//! let prices = load_dir("data/etfs", "*.csv", &DataConfig::default()).unwrap();
//! let input = OptimizationInput::single(prices).with_rebal_interval(21);
//!
//! let config = OptimizerConfig {
//!     iterations: 200,
//!     ..Default::default()
//! };
//! let mut optimizer = RebalanceOptimizer::new(config, RebalanceEvaluator::default()).unwrap();
//! let outcome = optimizer.run(&input).unwrap();
//!
//! println!("Best proportions: {}", outcome.best_allocation);
//! println!("{}", outcome.table.summary(5));
//! ```
//!
//! # Custom Evaluators
//!
//! Any closure from a [`ParameterCombination`](evaluator::ParameterCombination)
//! to a [`ResultTable`] is an evaluator. Rows must echo the combination's
//! candidate id so the optimizer can tell which perturbation won:
//!
//! ```
//! use rebalance_optimizer::evaluator::ParameterCombination;
//! use rebalance_optimizer::results::{HashSpan, Metrics, ResultRow, ResultTable};
//!
//! let evaluator = |c: &ParameterCombination<'_>| -> rebalance_optimizer::Result<ResultTable> {
//!     let start = chrono::Utc::now();
//!     Ok(ResultTable::new(vec![ResultRow {
//!         start_date: start,
//!         end_date: start,
//!         duration_secs: 0,
//!         key: HashSpan {
//!             stocks: c.prices.label(),
//!             strategy: c.strategy,
//!             candidate: c.kwargs.candidate,
//!             rebal_proportions: c.kwargs.rebal_proportions.to_string(),
//!             rebal_interval: c.kwargs.rebal_interval,
//!             starting_value: 1.0,
//!         },
//!         stepped_tests: 1,
//!         metrics: Metrics::default(),
//!     }]))
//! };
//! # let _ = evaluator;
//! ```
//!
//! # Modules
//!
//! - [`types`]: Bars, price-history sets and allocation vectors
//! - [`data`]: CSV loading and common-window truncation
//! - [`evaluator`]: The evaluator boundary and the built-in rebalance backtest
//! - [`results`]: Result rows, tables and export
//! - [`aggregate`]: Averaging of stepped runs
//! - [`fanout`]: Parallel evaluation of a sweep cross product
//! - [`optimizer`]: The coordinate-ascent loop
//! - [`config`]: TOML configuration file support
//! - [`metadata`]: Run ids and configuration hashes

pub mod aggregate;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluator;
pub mod fanout;
pub mod metadata;
pub mod optimizer;
pub mod results;
pub mod types;

// Re-exports for convenience
pub use aggregate::average_stepped;
pub use config::OptimizeFileConfig;
pub use data::{common_window, load_csv, load_dir, truncate_to_common_window, DataConfig};
pub use error::{OptimizerError, Result};
pub use evaluator::{
    BacktestEvaluator, EvaluatorConfig, ParameterCombination, RebalanceEvaluator, StrategyKwargs,
};
pub use fanout::{Deadline, FanOut, SweepSpace};
pub use optimizer::{
    build_candidates, Candidate, IterationOutcome, Optimization, OptimizationInput,
    OptimizerConfig, RebalanceOptimizer,
};
pub use results::{HashSpan, Metrics, ResultRow, ResultTable};
pub use types::{AllocationVector, Bar, OneOrMany, PriceHistorySet, StrategyKind};
