//! Error types for the optimizer.

use thiserror::Error;

/// Main error type for optimization runs.
#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Input shape error: {0}")]
    InputShape(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Candidate match failed: {0}")]
    CandidateMatch(String),

    #[error("Iteration {iteration} exceeded its time limit after {elapsed_ms} ms")]
    IterationTimeout { iteration: usize, elapsed_ms: u128 },

    #[error("Weight overflow: {0}")]
    WeightOverflow(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("No data loaded")]
    NoData,

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias for optimizer operations.
pub type Result<T> = std::result::Result<T, OptimizerError>;
