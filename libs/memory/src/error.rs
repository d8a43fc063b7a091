//! Allocator and ledger errors.

use fleet_id::AllocationId;
use thiserror::Error;

use crate::ram::Ram;

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Errors returned by the planner, the registry, and the allocator.
///
/// All of these are recoverable: callers can request fewer chunks, retry with
/// a fresh snapshot, or skip the work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// A worker with this hostname is already registered.
    #[error("worker already registered: {0}")]
    DuplicateWorker(String),

    /// No worker with this hostname is registered.
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    /// The request itself is malformed (zero-sized chunks, empty plans).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The fleet cannot hold the requested chunks right now.
    #[error("insufficient capacity: requested {requested} chunks, {satisfiable} satisfiable")]
    InsufficientCapacity { requested: u64, satisfiable: u64 },

    /// A worker's free RAM shrank between planning and commit.
    #[error("allocation conflict on {hostname}: plan needs {required}, {available} free")]
    AllocationConflict {
        hostname: String,
        required: Ram,
        available: Ram,
    },

    /// The allocation id was never issued (or no longer exists, for
    /// operations that require a live allocation).
    #[error("unknown allocation: {0}")]
    UnknownAllocation(AllocationId),
}

impl MemoryError {
    /// Returns true if retrying against a fresh snapshot may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, MemoryError::AllocationConflict { .. })
    }

    /// Largest chunk count the planner could have placed, if this is a
    /// capacity error.
    pub fn satisfiable(&self) -> Option<u64> {
        match self {
            MemoryError::InsufficientCapacity { satisfiable, .. } => Some(*satisfiable),
            _ => None,
        }
    }
}
