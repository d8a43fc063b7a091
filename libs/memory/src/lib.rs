//! # fleet-memory
//!
//! RAM bookkeeping for a fleet of worker hosts.
//!
//! ## Pieces
//!
//! - [`Worker`] / [`WorkerRegistry`]: known hosts and their RAM split into
//!   set-aside, reserved (used outside the allocator), allocated, and free.
//! - [`MemorySnapshot`]: an immutable copy of workers and allocations used for
//!   planning.
//! - [`plan_allocation`] / [`max_chunks_for_snapshot`]: pure functions over a
//!   snapshot.
//! - [`MemoryAllocator`]: the only place worker and allocation records are
//!   mutated. Commits are checked against current free RAM so a plan computed
//!   from a stale snapshot fails with [`MemoryError::AllocationConflict`]
//!   instead of overcommitting.
//!
//! # Invariants
//!
//! - `allocated + reserved + set_aside <= total` for every worker, always.
//! - Allocation ids are monotonic and never reused.
//! - A chunk never spans two workers.

mod allocator;
mod error;
mod ledger;
mod planner;
mod ram;
mod snapshot;
mod worker;

pub use allocator::{MemoryAllocator, ReleaseOutcome};
pub use error::{MemoryError, MemoryResult};
pub use ledger::{Allocation, AllocationLedger, Chunk, ExitScope, OwnerTag};
pub use planner::{
    max_chunks_for_snapshot, max_chunks_for_workers, plan_allocation, plan_for_workers,
    AllocationPlan, ChunkRequest, PlanEntry,
};
pub use ram::Ram;
pub use snapshot::MemorySnapshot;
pub use worker::{RefreshOutcome, Worker, WorkerRegistry};
