//! Command-line interface for the rebalance optimizer.

use rebalance_optimizer::aggregate::average_stepped;
use rebalance_optimizer::config::OptimizeFileConfig;
use rebalance_optimizer::error::{OptimizerError, Result};
use rebalance_optimizer::evaluator::{RebalanceEvaluator, StrategyKwargs};
use rebalance_optimizer::fanout::{FanOut, SweepSpace};
use rebalance_optimizer::optimizer::{Optimization, OptimizationInput, RebalanceOptimizer};
use rebalance_optimizer::results::ResultTable;
use rebalance_optimizer::types::AllocationVector;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Search for the rebalance proportions that maximize CAGR.
#[derive(Parser)]
#[command(name = "rebalance-optimizer")]
#[command(version)]
#[command(about = "Coordinate-ascent search over portfolio rebalance proportions")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate an example configuration file
    Init {
        /// Output path for config file
        #[arg(short, long, default_value = "optimize.toml")]
        output: PathBuf,
    },

    /// Run the optimizer from a configuration file
    Optimize {
        /// Path to TOML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Override the configured number of iterations
        #[arg(short, long)]
        iterations: Option<usize>,

        /// Write the final ranked results to this CSV file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Worker threads (defaults to one per core)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Evaluate the configured sweep once at equal weights
    Evaluate {
        /// Path to TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

impl Cli {
    /// Initialize logging based on verbosity level. `RUST_LOG` takes
    /// precedence when set.
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(io::stderr)
            .finish();

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Failed to set tracing subscriber: {}", e);
        }
    }
}

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    match &cli.command {
        Commands::Init { output } => init_config(output),

        Commands::Optimize {
            config,
            iterations,
            output,
            threads,
            no_progress,
        } => run_optimization(
            config,
            *iterations,
            output.as_deref(),
            *threads,
            *no_progress,
            cli.format,
        ),

        Commands::Evaluate { config } => run_evaluation(config, cli.format),
    }
}

fn init_config(output: &Path) -> Result<()> {
    fs::write(output, OptimizeFileConfig::example())?;
    println!("Created example configuration file: {}", output.display());
    println!("\nEdit this file to point at your price data, then run:");
    println!("  rebalance-optimizer optimize -c {}", output.display());
    Ok(())
}

/// Load a config file and its data; data directories are relative to the file.
fn load_config(config_path: &Path) -> Result<(OptimizeFileConfig, OptimizationInput)> {
    let file_config = OptimizeFileConfig::load(config_path)?;
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let input = file_config.to_input(base_dir)?;
    info!(
        "Loaded {} price-history sets ({} assets each)",
        input.price_sets.len(),
        input.n_stocks()?
    );
    Ok((file_config, input))
}

fn run_optimization(
    config_path: &Path,
    iterations: Option<usize>,
    output: Option<&Path>,
    threads: Option<usize>,
    no_progress: bool,
    format: OutputFormat,
) -> Result<()> {
    let (file_config, input) = load_config(config_path)?;

    let mut optimizer_config = file_config.optimizer.clone();
    if let Some(n) = iterations {
        optimizer_config.iterations = n;
    }
    if threads.is_some() {
        optimizer_config.threads = threads;
    }
    if no_progress || format != OutputFormat::Text {
        optimizer_config.show_progress = false;
    }

    let evaluator = RebalanceEvaluator::new(file_config.backtest.clone())?;
    let mut optimizer = RebalanceOptimizer::new(optimizer_config, evaluator)?;
    let outcome = optimizer.run(&input)?;

    let csv_path = output
        .map(Path::to_path_buf)
        .or_else(|| file_config.output.path.as_ref().map(PathBuf::from));
    if let Some(path) = csv_path {
        outcome.table.save_csv(&path)?;
    }

    match format {
        OutputFormat::Text => print_optimization(&outcome, &input, file_config.output.top),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Csv => outcome.table.write_csv(io::stdout())?,
    }

    Ok(())
}

fn print_optimization(outcome: &Optimization, input: &OptimizationInput, top: usize) {
    println!();
    println!("{}", "═".repeat(60).blue());
    println!("{}", " OPTIMIZATION RESULTS ".bold().blue());
    println!("{}", "═".repeat(60).blue());
    println!();

    println!("{}", "Run".bold().underline());
    println!("  Run ID:          {}", outcome.run_id);
    println!("  Config Hash:     {}", &outcome.config_hash[..outcome.config_hash.len().min(16)]);
    println!("  Iterations:      {}", outcome.iterations_run);
    if outcome.stopped_early {
        println!("  {}", "Stopped early: time budget exhausted".yellow());
    }
    println!("  Elapsed:         {:.2}s", outcome.elapsed_secs);
    println!();

    println!("{}", "Best Proportions".bold().underline());
    let tickers = input
        .price_sets
        .first()
        .map(|set| set.symbols())
        .unwrap_or_default();
    for (ticker, weight) in tickers.iter().zip(outcome.best_allocation.weights()) {
        println!("  {:<16} {:>7.2}%", ticker, weight * 100.0);
    }
    println!();

    println!("{}", "Final Iteration".bold().underline());
    println!("{}", outcome.table.summary(top));
}

fn run_evaluation(config_path: &Path, format: OutputFormat) -> Result<()> {
    let (file_config, input) = load_config(config_path)?;
    let price_sets = input.prepare()?;
    let n_stocks = input.n_stocks()?;

    let allocation = AllocationVector::equal(n_stocks)
        .ok_or_else(|| OptimizerError::InputShape("no assets to allocate".to_string()))?;
    let interval = input.rebal_intervals.first().copied().ok_or_else(|| {
        OptimizerError::Config("no rebalance interval configured".to_string())
    })?;

    let space = SweepSpace {
        price_sets: price_sets.iter().collect(),
        strategies: input.strategies.clone(),
        starts: input.starts.clone(),
        ends: input.ends.clone(),
        durations: input.durations.clone(),
        start_steps: input.start_steps.clone(),
        kwargs: vec![StrategyKwargs::new(allocation, interval)],
    };

    let fan_out = FanOut::new(file_config.optimizer.parallel, file_config.optimizer.threads)?;
    let evaluator = RebalanceEvaluator::new(file_config.backtest.clone())?;
    let table = fan_out.evaluate_space(&evaluator, &space, None)?;
    let table: ResultTable = if table.distinct_start_dates() > 1 {
        average_stepped(&table)
    } else {
        table
    }
    .ranked();

    match format {
        OutputFormat::Text => println!("{}", table.summary(file_config.output.top)),
        OutputFormat::Json => println!("{}", table.to_json()?),
        OutputFormat::Csv => table.write_csv(io::stdout())?,
    }

    Ok(())
}
