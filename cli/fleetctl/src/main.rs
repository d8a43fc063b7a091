//! fleetctl - operator CLI for a simulated worker fleet
//!
//! Boots an in-memory world with the memory and launch services and drives
//! them: run batches, launch scripts, inspect capacity, preview timings.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod config;
mod error;
mod fleet;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            error::print_error(&e);
            std::process::exit(1);
        }
    };

    // Prefer RUST_LOG, fall back to the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    // Logs go to stderr so command output stays parseable
    let registry = tracing_subscriber::registry().with(filter);
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if cli.log_json {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }

    if let Err(e) = cli.run(config).await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
