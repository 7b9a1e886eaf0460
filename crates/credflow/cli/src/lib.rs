//! credflow CLI
//!
//! Operator tooling for the self-service identity flows:
//! - Validate a flow configuration and show the steps each flow will take
//! - Simulate a password change or a registration end to end against
//!   in-memory collaborators

use clap::{Parser, Subcommand};
use std::ffi::OsString;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod error;
mod output;

use commands::{check_config, simulate};
pub use error::{CliError, CliResult};

/// credflow CLI application
#[derive(Parser)]
#[command(name = "credflow")]
#[command(about = "credflow - self-service identity flow tooling", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CREDFLOW_CONFIG")]
    config: Option<String>,

    /// Output format (text, json)
    #[arg(short, long, value_enum, default_value = "text")]
    output: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and list each flow's steps
    CheckConfig,

    /// Run a flow against in-memory collaborators
    Simulate {
        #[command(subcommand)]
        command: simulate::SimulateCommands,
    },
}

/// Run using the current process arguments.
pub async fn run() -> CliResult<()> {
    run_with_args(std::env::args_os()).await
}

/// Run using the provided argument iterator.
pub async fn run_with_args<I, T>(args: I) -> CliResult<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    let filter = if cli.verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).without_time())
        .try_init();

    let (config, source) = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::CheckConfig => check_config::execute(&config, &source, cli.output),
        Commands::Simulate { command } => simulate::execute(command, config, cli.output).await,
    }
}
