//! Immutable views of allocator state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryResult;
use crate::ledger::Allocation;
use crate::planner::{self, AllocationPlan, ChunkRequest};
use crate::ram::Ram;
use crate::worker::Worker;

/// A point-in-time copy of every worker and live allocation.
///
/// Capacity queries over a snapshot are pure: they never observe later
/// changes to the allocator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub workers: Vec<Worker>,
    pub allocations: Vec<Allocation>,
    /// Allocator mutation counter at the time the snapshot was taken.
    #[serde(default)]
    pub version: u64,
    pub taken_at: DateTime<Utc>,
}

impl MemorySnapshot {
    pub fn new(workers: Vec<Worker>, allocations: Vec<Allocation>) -> Self {
        Self {
            workers,
            allocations,
            version: 0,
            taken_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn worker(&self, hostname: &str) -> Option<&Worker> {
        self.workers.iter().find(|w| w.hostname() == hostname)
    }

    pub fn free_ram_total(&self) -> Ram {
        self.workers.iter().map(Worker::free_ram).sum()
    }

    pub fn allocated_ram_total(&self) -> Ram {
        self.workers.iter().map(Worker::allocated_ram).sum()
    }

    pub fn max_chunks(&self, chunk_size: Ram) -> u64 {
        planner::max_chunks_for_snapshot(self, chunk_size)
    }

    pub fn plan(&self, request: &ChunkRequest) -> MemoryResult<AllocationPlan> {
        planner::plan_allocation(self, request)
    }
}

impl Default for MemorySnapshot {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}
