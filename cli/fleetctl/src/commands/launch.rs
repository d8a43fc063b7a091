//! One-off script launches.

use anyhow::Result;
use clap::Args;
use fleet_proto::{LaunchArgs, LaunchResult, Placement};
use serde::Serialize;
use tabled::Tabled;

use super::CommandContext;
use crate::error::CliError;
use crate::fleet::Fleet;
use crate::output::{print_output, print_single, print_success, print_warning, OutputFormat};

/// Owner tag for allocations made from the command line.
const OWNER: &str = "fleetctl";

#[derive(Debug, Args)]
pub struct LaunchCommand {
    /// Script to run.
    script: String,

    /// Total threads across the fleet.
    #[arg(long)]
    threads: u64,

    /// Argument passed to every process (repeatable).
    #[arg(long = "host-arg", value_name = "ARG")]
    host_args: Vec<String>,

    /// All threads in one process on one worker.
    #[arg(long)]
    contiguous: bool,

    /// Fail and release everything if any worker fails to start.
    #[arg(long)]
    all_or_nothing: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct PlacementRow {
    #[tabled(rename = "WORKER")]
    hostname: String,
    #[tabled(rename = "THREADS")]
    threads: u64,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "ERROR")]
    error: String,
}

impl From<&Placement> for PlacementRow {
    fn from(placement: &Placement) -> Self {
        Self {
            hostname: placement.hostname.clone(),
            threads: placement.threads,
            pid: placement
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            error: placement.error.clone().unwrap_or_default(),
        }
    }
}

impl LaunchCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let args = self.args()?;

        let fleet = Fleet::boot(&ctx.config).await?;
        let launched = fleet.launcher().launch(args).await.map_err(CliError::from);
        fleet.shutdown().await;
        let result = launched?;

        match ctx.format {
            OutputFormat::Json => print_single(&result),
            OutputFormat::Table => self.print_table(&result),
        }
        Ok(())
    }

    fn args(&self) -> Result<LaunchArgs> {
        if self.script.trim().is_empty() {
            return Err(CliError::invalid("script name must not be empty").into());
        }
        if self.threads == 0 {
            return Err(CliError::invalid("--threads must be at least 1").into());
        }

        let mut args = LaunchArgs::new(self.script.as_str(), self.threads, OWNER)
            .with_args(self.host_args.iter().cloned());
        if self.contiguous {
            args = args.contiguous();
        }
        if self.all_or_nothing {
            args = args.all_or_nothing();
        }
        Ok(args)
    }

    fn print_table(&self, result: &LaunchResult) {
        print_success(&format!(
            "Launched {} with {} threads in allocation {}",
            self.script,
            result.started_threads(),
            result.allocation.id
        ));
        let rows: Vec<PlacementRow> = result.placements.iter().map(PlacementRow::from).collect();
        print_output(&rows, OutputFormat::Table);
        if result.has_gaps() {
            print_warning("Some workers failed to start; their RAM was released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(threads: u64) -> LaunchCommand {
        LaunchCommand {
            script: "share.js".to_string(),
            threads,
            host_args: vec!["n00dles".to_string(), "250".to_string()],
            contiguous: false,
            all_or_nothing: true,
        }
    }

    #[test]
    fn test_args_carry_flags() {
        let args = command(6).args().unwrap();
        assert_eq!(args.script, "share.js");
        assert_eq!(args.threads, 6);
        assert_eq!(args.args, vec!["n00dles", "250"]);
        assert_eq!(args.owner.as_str(), OWNER);
        assert!(args.all_or_nothing);
        assert!(!args.contiguous);
        assert!(args.allocation.is_none());
    }

    #[test]
    fn test_zero_threads_is_invalid() {
        let err = command(0).args().unwrap_err();
        assert!(err.to_string().contains("--threads"));
    }

    #[test]
    fn test_failed_placement_row() {
        let row = PlacementRow::from(&Placement {
            hostname: "beta".to_string(),
            threads: 2,
            pid: None,
            error: Some("exec failed".to_string()),
        });
        assert_eq!(row.pid, "-");
        assert_eq!(row.error, "exec failed");
    }
}
