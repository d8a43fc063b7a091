//! Phase offset preview.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use fleet_batcher::Schedule;
use fleet_proto::PhaseKind;
use serde::Serialize;
use tabled::Tabled;

use super::CommandContext;
use crate::error::CliError;
use crate::output::{print_info, print_output, OutputFormat};

#[derive(Debug, Args)]
pub struct OffsetsCommand {
    /// Hack duration in milliseconds.
    #[arg(long, value_name = "MS")]
    hack: u64,

    /// Grow duration in milliseconds.
    #[arg(long, value_name = "MS")]
    grow: u64,

    /// Weaken duration in milliseconds.
    #[arg(long, value_name = "MS")]
    weaken: u64,

    /// Gap between completions (defaults to the configured spacing).
    #[arg(long, value_name = "MS")]
    spacing: Option<u64>,
}

#[derive(Debug, Serialize, Tabled)]
struct OffsetRow {
    #[tabled(rename = "PHASE")]
    phase: PhaseKind,
    #[tabled(rename = "DURATION_MS")]
    duration_ms: u128,
    #[tabled(rename = "START_MS")]
    start_ms: u128,
    #[tabled(rename = "FINISH_MS")]
    finish_ms: u128,
}

impl OffsetsCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let schedule = self.schedule(ctx.config.batch.spacing_ms)?;

        let rows: Vec<OffsetRow> = schedule
            .phases
            .iter()
            .map(|p| OffsetRow {
                phase: p.kind,
                duration_ms: p.duration.as_millis(),
                start_ms: p.start.as_millis(),
                finish_ms: p.finish().as_millis(),
            })
            .collect();
        print_output(&rows, ctx.format);

        if ctx.format == OutputFormat::Table {
            print_info(&format!(
                "Batch lands in {} ms, {} ms apart",
                schedule.makespan().as_millis().to_string().bold(),
                schedule.spacing.as_millis()
            ));
        }
        Ok(())
    }

    fn schedule(&self, default_spacing_ms: u64) -> Result<Schedule> {
        let durations = [
            (PhaseKind::Hack, self.hack),
            (PhaseKind::Grow, self.grow),
            (PhaseKind::Weaken, self.weaken),
        ];
        if let Some((kind, _)) = durations.iter().find(|(_, ms)| *ms == 0) {
            return Err(CliError::invalid(format!("--{kind} duration must be positive")).into());
        }

        let phases: Vec<_> = durations
            .iter()
            .map(|(kind, ms)| (*kind, Duration::from_millis(*ms)))
            .collect();
        let spacing = Duration::from_millis(self.spacing.unwrap_or(default_spacing_ms));
        Ok(Schedule::compute(&phases, spacing))
    }
}
