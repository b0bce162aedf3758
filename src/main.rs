//! Trialstore CLI entry point.

use anyhow::Context;
use clap::Parser;

use trialstore::cli::{handle_error, run, Cli, CommandContext};
use trialstore::infrastructure::{setup_storage, ConfigLoader, LoggerImpl, RetryPolicy};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    if let Err(err) = run_cli(cli).await {
        handle_error(err, json);
    }
}

async fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };

    let _logger = LoggerImpl::init(&config.logging).context("Failed to initialize logging")?;

    let storage = setup_storage(&config)
        .await
        .context("Failed to initialize storage")?;

    let ctx = CommandContext {
        storage,
        retry: RetryPolicy::from(&config.retry),
        json: cli.json,
    };

    run(cli.command, &ctx).await
}
