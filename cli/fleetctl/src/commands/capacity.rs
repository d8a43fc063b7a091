//! Free RAM and chunk planning.

use anyhow::Result;
use clap::Args;
use fleet_memory::{AllocationPlan, ChunkRequest, MemorySnapshot, Ram, Worker};
use serde::Serialize;
use tabled::Tabled;

use super::CommandContext;
use crate::error::CliError;
use crate::fleet::Fleet;
use crate::output::{print_info, print_output, print_single, print_warning, OutputFormat};

#[derive(Debug, Args)]
pub struct CapacityCommand {
    /// RAM per chunk, in GB.
    #[arg(long, value_name = "GB")]
    chunk_size: f64,

    /// Chunks to plan for.
    #[arg(long, default_value_t = 1)]
    count: u64,

    /// All chunks on one worker.
    #[arg(long)]
    contiguous: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct WorkerRow {
    #[tabled(rename = "WORKER")]
    hostname: String,
    #[tabled(rename = "TOTAL")]
    total: Ram,
    #[tabled(rename = "SET_ASIDE")]
    set_aside: Ram,
    #[tabled(rename = "RESERVED")]
    reserved: Ram,
    #[tabled(rename = "ALLOCATED")]
    allocated: Ram,
    #[tabled(rename = "FREE")]
    free: Ram,
    #[tabled(rename = "CHUNKS")]
    max_chunks: u64,
}

impl WorkerRow {
    fn new(worker: &Worker, chunk_size: Ram) -> Self {
        Self {
            hostname: worker.hostname().to_string(),
            total: worker.total_ram(),
            set_aside: worker.set_aside_ram(),
            reserved: worker.reserved_ram(),
            allocated: worker.allocated_ram(),
            free: worker.free_ram(),
            max_chunks: worker.max_chunks(chunk_size),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct PlanRow {
    #[tabled(rename = "WORKER")]
    hostname: String,
    #[tabled(rename = "CHUNKS")]
    chunks: u64,
    #[tabled(rename = "RAM")]
    ram: Ram,
}

#[derive(Debug, Serialize)]
struct CapacityReport {
    chunk_size: Ram,
    requested: u64,
    contiguous: bool,
    satisfiable: u64,
    workers: Vec<WorkerRow>,
    plan: Option<Vec<PlanRow>>,
}

impl CapacityCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let request = self.request()?;

        let fleet = Fleet::boot(&ctx.config).await?;
        let snapshot = fleet.memory().snapshot().await.map_err(CliError::from);
        fleet.shutdown().await;
        let report = report(&snapshot?, &request);

        match ctx.format {
            OutputFormat::Json => print_single(&report),
            OutputFormat::Table => {
                print_output(&report.workers, ctx.format);
                match &report.plan {
                    Some(plan) => {
                        print_info(&format!(
                            "{} x {} fits ({} max)",
                            report.requested, report.chunk_size, report.satisfiable
                        ));
                        print_output(plan, ctx.format);
                    }
                    None => print_warning(&format!(
                        "{} x {} does not fit; {} satisfiable",
                        report.requested, report.chunk_size, report.satisfiable
                    )),
                }
            }
        }
        Ok(())
    }

    fn request(&self) -> Result<ChunkRequest> {
        if !self.chunk_size.is_finite() || self.chunk_size <= 0.0 {
            return Err(CliError::invalid("--chunk-size must be a positive number of GB").into());
        }
        if self.count == 0 {
            return Err(CliError::invalid("--count must be at least 1").into());
        }
        let chunk_size = Ram::from_gb_f64(self.chunk_size);
        if chunk_size == Ram::ZERO {
            return Err(CliError::invalid("--chunk-size is below 1 MB").into());
        }

        let request = ChunkRequest::new(chunk_size, self.count);
        Ok(if self.contiguous {
            request.contiguous()
        } else {
            request
        })
    }
}

fn report(snapshot: &MemorySnapshot, request: &ChunkRequest) -> CapacityReport {
    let workers = snapshot
        .workers
        .iter()
        .map(|w| WorkerRow::new(w, request.chunk_size))
        .collect();

    let (plan, satisfiable) = match snapshot.plan(request) {
        Ok(plan) => (Some(plan_rows(&plan)), max_satisfiable(snapshot, request)),
        Err(e) => (None, e.satisfiable().unwrap_or(0)),
    };

    CapacityReport {
        chunk_size: request.chunk_size,
        requested: request.chunk_count,
        contiguous: request.contiguous,
        satisfiable,
        workers,
        plan,
    }
}

fn max_satisfiable(snapshot: &MemorySnapshot, request: &ChunkRequest) -> u64 {
    if request.contiguous {
        snapshot
            .workers
            .iter()
            .map(|w| w.max_chunks(request.chunk_size))
            .max()
            .unwrap_or(0)
    } else {
        snapshot.max_chunks(request.chunk_size)
    }
}

fn plan_rows(plan: &AllocationPlan) -> Vec<PlanRow> {
    plan.entries
        .iter()
        .map(|e| PlanRow {
            hostname: e.hostname.clone(),
            chunks: e.chunks,
            ram: plan.chunk_size.times(e.chunks),
        })
        .collect()
}
