//! CLI commands.

mod capacity;
mod launch;
mod offsets;
mod run;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::FleetConfig;
use crate::output::OutputFormat;

/// fleetctl - Run batches and launch scripts across a simulated fleet.
#[derive(Debug, Parser)]
#[command(name = "fleetctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to ./fleet.toml when present).
    #[arg(long, global = true, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// World file describing servers, scripts, and targets.
    #[arg(long, global = true)]
    world: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run batches against a target.
    Run(run::RunCommand),

    /// Launch a script once across the fleet.
    Launch(launch::LaunchCommand),

    /// Show free RAM per worker and plan a chunk request.
    Capacity(capacity::CapacityCommand),

    /// Compute phase start offsets for a batch.
    Offsets(offsets::OffsetsCommand),
}

impl Cli {
    /// Loads the config file and applies `--world`.
    pub fn load_config(&self) -> Result<FleetConfig> {
        let mut config = FleetConfig::load(self.config.as_deref())?;
        if let Some(world) = &self.world {
            config.world = Some(world.clone());
        }
        Ok(config)
    }

    /// Run the CLI command.
    pub async fn run(self, config: FleetConfig) -> Result<()> {
        let ctx = CommandContext {
            config,
            format: OutputFormat::parse(&self.format),
        };

        match self.command {
            Commands::Run(cmd) => cmd.run(ctx).await,
            Commands::Launch(cmd) => cmd.run(ctx).await,
            Commands::Capacity(cmd) => cmd.run(ctx).await,
            Commands::Offsets(cmd) => cmd.run(ctx),
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: FleetConfig,
    pub format: OutputFormat,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "fleetctl",
            "offsets",
            "--hack",
            "1000",
            "--grow",
            "3200",
            "--weaken",
            "4000",
            "--world",
            "world.toml",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.world, Some(PathBuf::from("world.toml")));
        assert_eq!(OutputFormat::parse(&cli.format), OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Offsets(_)));
    }

    #[test]
    fn test_missing_required_arguments_are_rejected() {
        assert!(Cli::try_parse_from(["fleetctl", "launch", "share.js"]).is_err());
        assert!(Cli::try_parse_from(["fleetctl", "capacity"]).is_err());
        assert!(Cli::try_parse_from(["fleetctl", "run"]).is_err());
        assert!(Cli::try_parse_from(["fleetctl", "offsets", "--hack", "soon"]).is_err());
    }
}
