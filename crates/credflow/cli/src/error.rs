//! CLI error types

use credflow_types::FlowError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration could not be located or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// A flow rejected a simulated request
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    /// The simulation reached a state it cannot drive further
    #[error("Simulation stalled: {0}")]
    Simulation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;
