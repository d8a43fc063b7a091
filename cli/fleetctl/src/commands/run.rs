//! Batch runs against a target.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use fleet_batcher::{BatchStats, BatchWorker};
use serde::Serialize;
use tabled::Tabled;
use tokio::sync::watch;
use tracing::info;

use super::CommandContext;
use crate::error::CliError;
use crate::fleet::Fleet;
use crate::output::{print_info, print_output, OutputFormat};

#[derive(Debug, Args)]
pub struct RunCommand {
    /// Target server.
    target: String,

    /// Keep starting batches every interval until interrupted.
    #[arg(long = "continue")]
    continuous: bool,

    /// Stop after this many batches. Implies --continue.
    #[arg(long, value_name = "N")]
    batches: Option<u64>,
}

#[derive(Debug, Serialize, Tabled)]
struct StatsRow {
    #[tabled(rename = "TARGET")]
    target: String,
    #[tabled(rename = "COMPLETED")]
    completed: u64,
    #[tabled(rename = "FAILED")]
    failed: u64,
    #[tabled(rename = "TIMED_OUT")]
    timed_out: u64,
    #[tabled(rename = "ERRORS")]
    errors: u64,
    #[tabled(rename = "TOTAL")]
    total: u64,
}

impl StatsRow {
    fn new(target: &str, stats: &BatchStats) -> Self {
        Self {
            target: target.to_string(),
            completed: stats.completed,
            failed: stats.failed,
            timed_out: stats.timed_out,
            errors: stats.errors,
            total: stats.total(),
        }
    }
}

impl RunCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        if self.batches == Some(0) {
            return Err(CliError::invalid("--batches must be at least 1").into());
        }
        let continuous = self.continuous || self.batches.is_some();

        let fleet = Fleet::boot(&ctx.config).await?;
        let scheduler = match fleet.scheduler() {
            Ok(scheduler) => Arc::new(scheduler),
            Err(e) => {
                fleet.shutdown().await;
                return Err(e);
            }
        };
        let worker = BatchWorker::new(scheduler, self.target.as_str())
            .continuous(continuous)
            .with_max_batches(self.batches);

        if ctx.format == OutputFormat::Table && continuous {
            print_info(&format!("Running batches against {}; Ctrl+C to stop", self.target));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let run = worker.run(stop_rx);
        tokio::pin!(run);
        let stats = tokio::select! {
            stats = &mut run => stats,
            Ok(()) = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                let _ = stop_tx.send(true);
                run.await
            }
        };
        fleet.shutdown().await;

        print_output(&[StatsRow::new(&self.target, &stats)], ctx.format);
        if stats.total() > 0 && stats.completed == 0 {
            return Err(anyhow::anyhow!("No batch against {} completed", self.target));
        }
        Ok(())
    }
}
