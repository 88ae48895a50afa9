//! Integration tests for the optimizer, from CSV files to ranked results.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rebalance_optimizer::config::OptimizeFileConfig;
use rebalance_optimizer::data::{load_dir, truncate_to_common_window, DataConfig};
use rebalance_optimizer::error::OptimizerError;
use rebalance_optimizer::evaluator::{
    BacktestEvaluator, EvaluatorConfig, ParameterCombination, RebalanceEvaluator, StrategyKwargs,
};
use rebalance_optimizer::fanout::{FanOut, SweepSpace};
use rebalance_optimizer::optimizer::{OptimizationInput, OptimizerConfig, RebalanceOptimizer};
use rebalance_optimizer::results::ResultTable;
use rebalance_optimizer::types::{AllocationVector, Bar, PriceHistorySet, StrategyKind};
use std::fs;
use std::io::Write;
use std::path::Path;

fn day(i: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 1, 4, 0, 0, 0).unwrap() + Duration::days(i)
}

/// Deterministic close series with a trend and some noise.
fn create_synthetic_closes(days: i64, initial_price: f64, daily_return: f64) -> Vec<Bar> {
    let mut price = initial_price;
    (0..days)
        .map(|i| {
            let noise = ((i as f64 * 0.7).sin() * 2.0 + (i as f64 * 1.3).cos()) * 0.05;
            price *= 1.0 + daily_return;
            Bar::from_close(day(i), (price + noise).max(1.0))
        })
        .collect()
}

fn write_csv(dir: &Path, ticker: &str, bars: &[Bar]) {
    let mut f = fs::File::create(dir.join(format!("{}.csv", ticker))).unwrap();
    writeln!(f, "Date,Open,High,Low,Close,Volume").unwrap();
    for b in bars {
        writeln!(
            f,
            "{},{},{},{},{},{}",
            b.timestamp.format("%Y-%m-%d"),
            b.open,
            b.high,
            b.low,
            b.close,
            b.volume
        )
        .unwrap();
    }
}

fn quiet_config(iterations: usize) -> OptimizerConfig {
    OptimizerConfig {
        iterations,
        show_progress: false,
        ..Default::default()
    }
}

#[test]
fn test_rising_asset_accumulates_weight() {
    let prices = PriceHistorySet::new()
        .with("FLAT", (0..250).map(|i| Bar::from_close(day(i), 50.0)).collect())
        .with("UP", create_synthetic_closes(250, 100.0, 0.002));
    let input = OptimizationInput::single(prices).with_rebal_interval(20);

    let mut optimizer =
        RebalanceOptimizer::new(quiet_config(15), RebalanceEvaluator::default()).unwrap();
    let outcome = optimizer.run(&input).unwrap();

    // Tickers sort as FLAT, UP; only UP ever wins.
    assert_eq!(outcome.best_ratios[0], 100);
    assert!(outcome.best_ratios[1] > 100);
    assert!(outcome.best_allocation.weights()[1] > 0.9);
    assert_eq!(outcome.iterations_run, 15);
    assert!(!outcome.stopped_early);

    let top = outcome.table.top().unwrap();
    assert_eq!(top.key.candidate, Some(1));
    assert_eq!(top.key.stocks, "FLAT,UP");
    assert!(outcome
        .table
        .rows()
        .windows(2)
        .all(|w| w[0].cagr() >= w[1].cagr()));
}

#[test]
fn test_optimize_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let prices = dir.path().join("prices");
    fs::create_dir(&prices).unwrap();
    write_csv(&prices, "AAA", &create_synthetic_closes(300, 100.0, 0.001));
    write_csv(&prices, "BBB", &create_synthetic_closes(280, 40.0, 0.0005));
    write_csv(&prices, "CCC", &create_synthetic_closes(320, 10.0, -0.0005));

    let config_path = dir.path().join("optimize.toml");
    fs::write(
        &config_path,
        r#"
[optimizer]
iterations = 5
parallel = true
threads = 2

[[data.sets]]
dir = "prices"

[sweep]
strategy = "rebalance"
duration_days = 120
start_step_days = 60
rebal_interval = 10
"#,
    )
    .unwrap();

    let file_config = OptimizeFileConfig::load(&config_path).unwrap();
    let input = file_config.to_input(dir.path()).unwrap();
    assert_eq!(input.n_stocks().unwrap(), 3);

    let evaluator = RebalanceEvaluator::new(file_config.backtest.clone()).unwrap();
    let mut optimizer = RebalanceOptimizer::new(file_config.optimizer.clone(), evaluator).unwrap();
    let outcome = optimizer.run(&input).unwrap();

    // Three candidates, each averaged over its stepped windows.
    assert_eq!(outcome.table.len(), 3);
    assert!(outcome.table.rows().iter().all(|r| r.stepped_tests > 1));
    assert!((outcome.best_allocation.sum() - 1.0).abs() < 1e-9);
    assert_eq!(outcome.config_hash.len(), 64);

    let csv_path = dir.path().join("results.csv");
    outcome.table.save_csv(&csv_path).unwrap();
    let text = fs::read_to_string(&csv_path).unwrap();
    assert_eq!(text.lines().count(), 4);
    assert!(text.starts_with("Start Date,End Date,Duration,Stocks,Strategy"));
}

#[test]
fn test_multiple_price_sets_share_common_window() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    fs::create_dir(&first).unwrap();
    fs::create_dir(&second).unwrap();
    write_csv(&first, "A", &create_synthetic_closes(200, 10.0, 0.001));
    write_csv(&first, "B", &create_synthetic_closes(200, 20.0, 0.0));
    write_csv(&second, "C", &create_synthetic_closes(150, 30.0, 0.002)[20..]);
    write_csv(&second, "D", &create_synthetic_closes(180, 40.0, -0.001));

    let sets = vec![
        load_dir(&first, "*.csv", &DataConfig::default()).unwrap(),
        load_dir(&second, "*.csv", &DataConfig::default()).unwrap(),
    ];
    let truncated = truncate_to_common_window(&sets).unwrap();
    for set in &truncated {
        for (_, bars) in set.iter() {
            assert_eq!(bars.first().unwrap().timestamp, day(20));
            assert_eq!(bars.last().unwrap().timestamp, day(149));
        }
    }

    let input = OptimizationInput::new(sets);
    let mut optimizer =
        RebalanceOptimizer::new(quiet_config(3), RebalanceEvaluator::default()).unwrap();
    let outcome = optimizer.run(&input).unwrap();

    // Two sets, two candidates each.
    assert_eq!(outcome.table.len(), 4);
    let mut stocks: Vec<_> = outcome.table.rows().iter().map(|r| r.key.stocks.clone()).collect();
    stocks.sort();
    stocks.dedup();
    assert_eq!(stocks, vec!["A,B".to_string(), "C,D".to_string()]);
}

#[test]
fn test_sweep_over_strategies_and_starts() {
    let prices = PriceHistorySet::new()
        .with("X", create_synthetic_closes(400, 100.0, 0.001))
        .with("Y", create_synthetic_closes(400, 100.0, 0.0002));
    let allocation = AllocationVector::equal(2).unwrap();

    let mut space = SweepSpace::new(vec![&prices], vec![StrategyKwargs::new(allocation, 21)]);
    space.strategies = vec![StrategyKind::Rebalance, StrategyKind::BuyAndHold];
    space.starts = vec![Some(day(0)), Some(day(100))];

    let table = FanOut::default()
        .evaluate_space(&RebalanceEvaluator::default(), &space, None)
        .unwrap();
    assert_eq!(table.len(), 4);
    assert_eq!(table.distinct_start_dates(), 2);

    let hold_rows: Vec<_> = table
        .rows()
        .iter()
        .filter(|r| r.key.strategy == StrategyKind::BuyAndHold)
        .collect();
    assert_eq!(hold_rows.len(), 2);
    assert!(hold_rows.iter().all(|r| r.metrics.rebalances == 0.0));
}

/// Pin a closure to the evaluator signature.
fn scripted<F>(f: F) -> F
where
    F: Fn(&ParameterCombination<'_>) -> rebalance_optimizer::Result<ResultTable> + Send + Sync,
{
    f
}

#[test]
fn test_custom_evaluator_drives_search() {
    // Score each allocation by its weight on the last asset.
    let evaluator = scripted(|c| {
        let score = c.kwargs.rebal_proportions.weights().last().copied().unwrap_or(0.0);
        let rows = RebalanceEvaluator::default()
            .evaluate(c)?
            .into_rows()
            .into_iter()
            .map(|mut row| {
                row.metrics.cagr = score;
                row
            })
            .collect();
        Ok(ResultTable::new(rows))
    });

    let prices = PriceHistorySet::new()
        .with("A", create_synthetic_closes(60, 10.0, 0.0))
        .with("B", create_synthetic_closes(60, 10.0, 0.0))
        .with("C", create_synthetic_closes(60, 10.0, 0.0));

    let mut optimizer = RebalanceOptimizer::new(quiet_config(4), evaluator).unwrap();
    let outcome = optimizer.run(&OptimizationInput::single(prices)).unwrap();
    assert_eq!(&outcome.best_ratios[..2], &[100, 100]);
    assert!(outcome.best_ratios[2] > 100);
}

#[test]
fn test_commission_is_applied_through_optimizer() {
    let prices = PriceHistorySet::new()
        .with("A", create_synthetic_closes(120, 100.0, 0.001))
        .with("B", create_synthetic_closes(120, 80.0, 0.0));
    let input = OptimizationInput::single(prices).with_rebal_interval(5);

    let free = RebalanceOptimizer::new(quiet_config(1), RebalanceEvaluator::default())
        .unwrap()
        .run(&input)
        .unwrap();
    let costly = RebalanceOptimizer::new(
        quiet_config(1),
        RebalanceEvaluator::new(EvaluatorConfig {
            commission_pct: 1.0,
            ..Default::default()
        })
        .unwrap(),
    )
    .unwrap()
    .run(&input)
    .unwrap();

    assert!(
        costly.table.top().unwrap().metrics.ending_value
            < free.table.top().unwrap().metrics.ending_value
    );
}

#[test]
fn test_history_shorter_than_duration_fails() {
    let prices = PriceHistorySet::new()
        .with("A", create_synthetic_closes(30, 10.0, 0.0))
        .with("B", create_synthetic_closes(30, 10.0, 0.0));
    let input = OptimizationInput::single(prices).with_duration(Duration::days(365));

    let mut optimizer =
        RebalanceOptimizer::new(quiet_config(2), RebalanceEvaluator::default()).unwrap();
    assert!(matches!(
        optimizer.run(&input),
        Err(OptimizerError::InputShape(_))
    ));
}

#[test]
fn test_sequential_and_parallel_agree() {
    let prices = PriceHistorySet::new()
        .with("A", create_synthetic_closes(200, 10.0, 0.001))
        .with("B", create_synthetic_closes(200, 20.0, 0.0005))
        .with("C", create_synthetic_closes(200, 30.0, 0.0));
    let input = OptimizationInput::single(prices)
        .with_duration(Duration::days(90))
        .with_start_step(Duration::days(30));

    let run = |parallel: bool| {
        let config = OptimizerConfig {
            parallel,
            ..quiet_config(6)
        };
        RebalanceOptimizer::new(config, RebalanceEvaluator::default())
            .unwrap()
            .run(&input)
            .unwrap()
    };

    let sequential = run(false);
    let parallel = run(true);
    assert_eq!(sequential.best_ratios, parallel.best_ratios);
    assert_eq!(sequential.table, parallel.table);
}
