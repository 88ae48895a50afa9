//! Configuration file support for optimization runs.
//!
//! A TOML file holds the search schedule, the evaluator settings, where to
//! load price data from and the sweep dimensions. Sweep values may be given
//! as a scalar or as a list.

use crate::data::{load_dir, DataConfig};
use crate::error::{OptimizerError, Result};
use crate::evaluator::EvaluatorConfig;
use crate::optimizer::{OptimizationInput, OptimizerConfig, DEFAULT_REBAL_INTERVAL};
use crate::types::{OneOrMany, StrategyKind};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Complete optimization configuration loaded from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizeFileConfig {
    /// Search schedule and execution settings.
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Evaluator settings.
    #[serde(default)]
    pub backtest: EvaluatorConfig,
    /// Price data sources.
    #[serde(default)]
    pub data: DataSettings,
    /// Sweep dimensions.
    #[serde(default)]
    pub sweep: SweepSettings,
    /// Result output.
    #[serde(default)]
    pub output: OutputSettings,
}

/// Price data settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// Price-history sets; each is a directory of per-ticker CSV files.
    #[serde(default)]
    pub sets: Vec<PriceSetSource>,
    /// Date format in CSV.
    pub date_format: Option<String>,
    /// CSV delimiter.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Skip malformed rows instead of failing.
    #[serde(default = "default_true")]
    pub skip_invalid: bool,
    /// Skip ticker files that fail to load instead of failing.
    #[serde(default)]
    pub skip_failed_files: bool,
}

fn default_delimiter() -> char {
    ','
}
fn default_true() -> bool {
    true
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            sets: Vec::new(),
            date_format: None,
            delimiter: ',',
            skip_invalid: true,
            skip_failed_files: false,
        }
    }
}

/// One price-history set on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSetSource {
    /// Directory holding one CSV file per ticker.
    pub dir: String,
    /// File pattern inside `dir`.
    #[serde(default = "default_pattern")]
    pub pattern: String,
}

fn default_pattern() -> String {
    "*.csv".to_string()
}

/// Sweep dimensions. Unset dimensions take a single default value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepSettings {
    /// Strategies: "rebalance" and/or "buy-and-hold".
    pub strategy: Option<OneOrMany<StrategyKind>>,
    /// Window start dates (YYYY-MM-DD).
    pub start: Option<OneOrMany<String>>,
    /// Window end dates (YYYY-MM-DD).
    pub end: Option<OneOrMany<String>>,
    /// Window lengths in days.
    pub duration_days: Option<OneOrMany<i64>>,
    /// Offsets between stepped window starts, in days.
    pub start_step_days: Option<OneOrMany<i64>>,
    /// Bars between rebalances; only the first value is used.
    pub rebal_interval: Option<OneOrMany<usize>>,
}

/// Output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    /// CSV file for the final ranked results.
    pub path: Option<String>,
    /// Rows shown in the text summary.
    #[serde(default = "default_top")]
    pub top: usize,
}

fn default_top() -> usize {
    10
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            path: None,
            top: default_top(),
        }
    }
}

fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| OptimizerError::Config(format!("invalid date '{}': {}", s, e)))?;
    Ok(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)))
}

fn parse_dates(values: &Option<OneOrMany<String>>) -> Result<Vec<Option<DateTime<Utc>>>> {
    match values {
        None => Ok(vec![None]),
        Some(v) => v.to_vec().iter().map(|s| parse_date(s).map(Some)).collect(),
    }
}

fn parse_days(values: &Option<OneOrMany<i64>>, name: &str) -> Result<Vec<Option<Duration>>> {
    match values {
        None => Ok(vec![None]),
        Some(v) => v
            .to_vec()
            .into_iter()
            .map(|d| {
                if d <= 0 {
                    Err(OptimizerError::Config(format!(
                        "{} must be positive, got {}",
                        name, d
                    )))
                } else {
                    Ok(Some(Duration::days(d)))
                }
            })
            .collect(),
    }
}

impl SweepSettings {
    /// Normalize every dimension to a sequence, leaving price sets empty.
    pub fn to_input(&self) -> Result<OptimizationInput> {
        let strategies = self
            .strategy
            .as_ref()
            .map_or_else(|| vec![StrategyKind::Rebalance], OneOrMany::to_vec);
        let rebal_intervals = self
            .rebal_interval
            .as_ref()
            .map_or_else(|| vec![DEFAULT_REBAL_INTERVAL], OneOrMany::to_vec);

        Ok(OptimizationInput::new(Vec::new())
            .with_strategies(strategies)
            .with_starts(parse_dates(&self.start)?)
            .with_ends(parse_dates(&self.end)?)
            .with_durations(parse_days(&self.duration_days, "duration_days")?)
            .with_start_steps(parse_days(&self.start_step_days, "start_step_days")?)
            .with_rebal_intervals(rebal_intervals))
    }
}

impl DataSettings {
    pub fn to_data_config(&self) -> Result<DataConfig> {
        if !self.delimiter.is_ascii() {
            return Err(OptimizerError::Config(format!(
                "delimiter must be an ASCII character, got '{}'",
                self.delimiter
            )));
        }
        Ok(DataConfig {
            date_format: self.date_format.clone(),
            delimiter: self.delimiter as u8,
            skip_invalid: self.skip_invalid,
            skip_failed_files: self.skip_failed_files,
        })
    }
}

impl OptimizeFileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: OptimizeFileConfig = toml::from_str(&content)?;
        config.optimizer.validate()?;
        config.backtest.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| OptimizerError::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Load every configured price-history set and build the sweep input.
    ///
    /// Relative data directories are resolved against `base_dir`.
    pub fn to_input(&self, base_dir: impl AsRef<Path>) -> Result<OptimizationInput> {
        if self.data.sets.is_empty() {
            return Err(OptimizerError::Config(
                "no price-history sets configured under [[data.sets]]".to_string(),
            ));
        }

        let data_config = self.data.to_data_config()?;
        let base_dir = base_dir.as_ref();
        let price_sets = self
            .data
            .sets
            .iter()
            .map(|source| load_dir(base_dir.join(&source.dir), &source.pattern, &data_config))
            .collect::<Result<Vec<_>>>()?;

        let mut input = self.sweep.to_input()?;
        input.price_sets = price_sets;
        Ok(input)
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# Rebalance optimizer configuration

[optimizer]
iterations = 1000
initial_step = 0.01
decay_rate = 0.93
min_step_fraction = 0.1
parallel = true
# threads = 8
# iteration_timeout_secs = 60.0
# time_budget_secs = 3600.0
show_progress = true

[backtest]
starting_value = 10000.0
commission_pct = 0.0    # percent of traded notional
periods_per_year = 252.0

[data]
# date_format = "%Y-%m-%d"
delimiter = ","
skip_invalid = true
skip_failed_files = false

[[data.sets]]
dir = "data/etfs"
pattern = "*.csv"

# [[data.sets]]
# dir = "data/sectors"

[sweep]
strategy = "rebalance"
rebal_interval = 21
# start = ["2015-01-01", "2018-01-01"]
# end = "2023-12-31"
# duration_days = 1095
# start_step_days = 90

[output]
# path = "results.csv"
top = 10
"#
        .to_string()
    }
}
