//! Operator command-line interface.
//!
//! Every command talks to the storage protocol only; shell-driven workers use
//! `trial reserve`, `trial ingest` and `trial heartbeat` the same way a
//! library caller would.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::domain::ports::StorageProtocol;
use crate::domain::StorageError;
use crate::infrastructure::RetryPolicy;

#[derive(Parser, Debug)]
#[command(name = "trialstore")]
#[command(about = "Experiment and trial bookkeeping for distributed search workers", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Configuration file (defaults to .trialstore/config.yaml)
    #[arg(short, long, global = true, env = "TRIALSTORE_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Per-experiment trial counts and best objective so far
    Status(commands::status::StatusArgs),

    /// Experiment management commands
    Experiment(commands::experiment::ExperimentArgs),

    /// Trial management commands
    Trial(commands::trial::TrialArgs),
}

/// Shared state handed to every command.
pub struct CommandContext {
    pub storage: Arc<dyn StorageProtocol>,
    pub retry: RetryPolicy,
    pub json: bool,
}

/// Run the parsed command.
pub async fn run(command: Commands, ctx: &CommandContext) -> anyhow::Result<()> {
    match command {
        Commands::Status(args) => commands::status::execute(args, ctx).await,
        Commands::Experiment(args) => commands::experiment::execute(args, ctx).await,
        Commands::Trial(args) => commands::trial::execute(args, ctx).await,
    }
}

/// Print an error and exit with a status code that distinguishes its class.
///
/// 1 for failures of the request itself, 2 for configuration, 3 for backend I/O.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    let code = match err.downcast_ref::<StorageError>() {
        Some(StorageError::Configuration(_) | StorageError::NotInitialized) => 2,
        Some(e) if e.is_transient() => 3,
        _ => 1,
    };

    if json_mode {
        let body = serde_json::json!({
            "success": false,
            "error": format!("{err:#}"),
        });
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(code)
}
