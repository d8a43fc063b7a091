//! Allocation planning.
//!
//! Planning is a pure function of a set of workers: it never mutates
//! anything, so the same snapshot always yields the same plan.
//!
//! ## Packing policy
//!
//! Workers are visited largest free RAM first (ties broken by hostname), and
//! each takes as many chunks as fit before moving on. This packs a request
//! onto the fewest workers. Contiguous requests must land on one worker and
//! use the first (largest) worker that holds them all.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};
use crate::ram::Ram;
use crate::snapshot::MemorySnapshot;
use crate::worker::Worker;

/// A request for `chunk_count` chunks of `chunk_size` each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub chunk_size: Ram,
    pub chunk_count: u64,
    /// All chunks must be placed on a single worker.
    #[serde(default)]
    pub contiguous: bool,
}

impl ChunkRequest {
    pub fn new(chunk_size: Ram, chunk_count: u64) -> Self {
        Self {
            chunk_size,
            chunk_count,
            contiguous: false,
        }
    }

    /// Requires every chunk on one worker.
    #[must_use]
    pub fn contiguous(mut self) -> Self {
        self.contiguous = true;
        self
    }

    /// Same request with a different chunk count.
    #[must_use]
    pub fn with_count(mut self, chunk_count: u64) -> Self {
        self.chunk_count = chunk_count;
        self
    }

    pub fn total_ram(&self) -> Ram {
        self.chunk_size.times(self.chunk_count)
    }

    fn validate(&self) -> MemoryResult<()> {
        if self.chunk_size.is_zero() {
            return Err(MemoryError::InvalidArgument(
                "chunk size must be positive".to_string(),
            ));
        }
        if self.chunk_count == 0 {
            return Err(MemoryError::InvalidArgument(
                "chunk count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Chunks placed on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub hostname: String,
    pub chunks: u64,
}

/// Where each chunk of a request should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub chunk_size: Ram,
    pub entries: Vec<PlanEntry>,
}

impl AllocationPlan {
    pub fn total_chunks(&self) -> u64 {
        self.entries.iter().map(|e| e.chunks).sum()
    }

    pub fn total_ram(&self) -> Ram {
        self.chunk_size.times(self.total_chunks())
    }

    pub fn is_empty(&self) -> bool {
        self.total_chunks() == 0
    }

    /// RAM the plan needs on each worker. A worker named twice is summed.
    pub fn ram_by_worker(&self) -> BTreeMap<&str, Ram> {
        let mut by_worker = BTreeMap::new();
        for entry in &self.entries {
            *by_worker.entry(entry.hostname.as_str()).or_insert(Ram::ZERO) +=
                self.chunk_size.times(entry.chunks);
        }
        by_worker
    }
}

/// Plans `request` over a snapshot.
pub fn plan_allocation(
    snapshot: &MemorySnapshot,
    request: &ChunkRequest,
) -> MemoryResult<AllocationPlan> {
    plan_for_workers(&snapshot.workers, request)
}

/// Total chunks of `chunk_size` that fit across the snapshot right now.
///
/// Zero for a zero chunk size.
pub fn max_chunks_for_snapshot(snapshot: &MemorySnapshot, chunk_size: Ram) -> u64 {
    max_chunks_for_workers(&snapshot.workers, chunk_size)
}

/// Sum over workers of `floor(free / chunk_size)`.
pub fn max_chunks_for_workers<'a, I>(workers: I, chunk_size: Ram) -> u64
where
    I: IntoIterator<Item = &'a Worker>,
{
    workers
        .into_iter()
        .map(|w| w.max_chunks(chunk_size))
        .sum()
}

/// Plans `request` over an arbitrary set of workers.
pub fn plan_for_workers<'a, I>(workers: I, request: &ChunkRequest) -> MemoryResult<AllocationPlan>
where
    I: IntoIterator<Item = &'a Worker>,
{
    request.validate()?;

    let mut candidates: Vec<(&Worker, u64)> = workers
        .into_iter()
        .map(|w| (w, w.max_chunks(request.chunk_size)))
        .filter(|(_, fits)| *fits > 0)
        .collect();
    candidates.sort_by(|(a, _), (b, _)| {
        b.free_ram()
            .cmp(&a.free_ram())
            .then_with(|| a.hostname().cmp(b.hostname()))
    });

    if request.contiguous {
        let best = candidates.first().map(|(_, fits)| *fits).unwrap_or(0);
        return match candidates.first() {
            Some((worker, fits)) if *fits >= request.chunk_count => Ok(AllocationPlan {
                chunk_size: request.chunk_size,
                entries: vec![PlanEntry {
                    hostname: worker.hostname().to_string(),
                    chunks: request.chunk_count,
                }],
            }),
            _ => Err(MemoryError::InsufficientCapacity {
                requested: request.chunk_count,
                satisfiable: best,
            }),
        };
    }

    let satisfiable: u64 = candidates.iter().map(|(_, fits)| *fits).sum();
    if satisfiable < request.chunk_count {
        return Err(MemoryError::InsufficientCapacity {
            requested: request.chunk_count,
            satisfiable,
        });
    }

    let mut remaining = request.chunk_count;
    let mut entries = Vec::new();
    for (worker, fits) in candidates {
        if remaining == 0 {
            break;
        }
        let take = fits.min(remaining);
        entries.push(PlanEntry {
            hostname: worker.hostname().to_string(),
            chunks: take,
        });
        remaining -= take;
    }

    Ok(AllocationPlan {
        chunk_size: request.chunk_size,
        entries,
    })
}
