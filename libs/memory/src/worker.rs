//! Worker hosts and the registry that tracks them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MemoryError, MemoryResult};
use crate::ram::Ram;

/// A compute host with RAM available to run script processes.
///
/// RAM is split four ways:
///
/// ```text
/// total = set_aside + reserved + allocated + free
/// ```
///
/// - `set_aside`: kept free by policy (e.g. headroom on `home`).
/// - `reserved`: in use by processes the allocator does not manage.
/// - `allocated`: sum of allocation chunks placed here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    hostname: String,
    total_ram: Ram,
    #[serde(default)]
    set_aside_ram: Ram,
    #[serde(default)]
    reserved_ram: Ram,
    #[serde(default)]
    allocated_ram: Ram,
}

/// What a [`Worker::refresh`] had to do to keep the RAM invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshOutcome {
    /// Reserved RAM reported by the host that did not fit and was dropped.
    pub reserved_clamped: Ram,
    /// Set-aside RAM that no longer fit and was dropped.
    pub set_aside_clamped: Ram,
}

impl RefreshOutcome {
    pub fn was_clamped(&self) -> bool {
        !self.reserved_clamped.is_zero() || !self.set_aside_clamped.is_zero()
    }
}

impl Worker {
    /// Creates an idle worker.
    pub fn new(hostname: impl Into<String>, total_ram: Ram) -> Self {
        Self {
            hostname: hostname.into(),
            total_ram,
            set_aside_ram: Ram::ZERO,
            reserved_ram: Ram::ZERO,
            allocated_ram: Ram::ZERO,
        }
    }

    /// Sets the policy headroom, clamped to what is not already in use.
    #[must_use]
    pub fn with_set_aside(mut self, ram: Ram) -> Self {
        self.set_set_aside(ram);
        self
    }

    /// Sets RAM used outside the allocator, clamped to what fits.
    #[must_use]
    pub fn with_reserved(mut self, ram: Ram) -> Self {
        let room = self.total_ram.saturating_sub(self.allocated_ram);
        self.reserved_ram = ram.min(room);
        self.set_aside_ram = self
            .set_aside_ram
            .min(room.saturating_sub(self.reserved_ram));
        self
    }

    /// Sets allocated RAM directly, clamped to what fits.
    ///
    /// Only meant for describing snapshots taken elsewhere; live workers get
    /// their allocated RAM from the [`MemoryAllocator`](crate::MemoryAllocator).
    #[must_use]
    pub fn with_allocated(mut self, ram: Ram) -> Self {
        let room = self
            .total_ram
            .saturating_sub(self.set_aside_ram)
            .saturating_sub(self.reserved_ram);
        self.allocated_ram = ram.min(room);
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn total_ram(&self) -> Ram {
        self.total_ram
    }

    pub fn set_aside_ram(&self) -> Ram {
        self.set_aside_ram
    }

    pub fn reserved_ram(&self) -> Ram {
        self.reserved_ram
    }

    pub fn allocated_ram(&self) -> Ram {
        self.allocated_ram
    }

    /// RAM available for new allocations.
    pub fn free_ram(&self) -> Ram {
        self.total_ram
            .saturating_sub(self.set_aside_ram)
            .saturating_sub(self.reserved_ram)
            .saturating_sub(self.allocated_ram)
    }

    /// Number of whole chunks of `chunk_size` that fit in free RAM.
    pub fn max_chunks(&self, chunk_size: Ram) -> u64 {
        self.free_ram().chunks_of(chunk_size)
    }

    /// Checks the RAM invariant.
    pub fn is_consistent(&self) -> bool {
        let used = self.allocated_ram + self.reserved_ram + self.set_aside_ram;
        used <= self.total_ram
    }

    /// Updates the policy headroom, clamped to the RAM not in use.
    pub fn set_set_aside(&mut self, ram: Ram) {
        let room = self
            .total_ram
            .saturating_sub(self.reserved_ram)
            .saturating_sub(self.allocated_ram);
        self.set_aside_ram = ram.min(room);
    }

    /// Updates capacity from a fresh host reading.
    ///
    /// Allocated RAM is never reduced here. If the new numbers do not fit,
    /// reserved RAM is clamped first, then set-aside RAM.
    pub fn refresh(&mut self, total_ram: Ram, reserved_ram: Ram) -> RefreshOutcome {
        let mut outcome = RefreshOutcome::default();
        self.total_ram = total_ram.max(self.allocated_ram);

        let room = self.total_ram.saturating_sub(self.allocated_ram);
        if reserved_ram > room {
            outcome.reserved_clamped = reserved_ram.saturating_sub(room);
        }
        self.reserved_ram = reserved_ram.min(room);

        let room = room.saturating_sub(self.reserved_ram);
        if self.set_aside_ram > room {
            outcome.set_aside_clamped = self.set_aside_ram.saturating_sub(room);
            self.set_aside_ram = room;
        }

        outcome
    }

    /// Places `ram` of allocation chunks on this worker.
    pub(crate) fn place(&mut self, ram: Ram) -> MemoryResult<()> {
        let available = self.free_ram();
        if ram > available {
            return Err(MemoryError::AllocationConflict {
                hostname: self.hostname.clone(),
                required: ram,
                available,
            });
        }
        self.allocated_ram += ram;
        Ok(())
    }

    /// Returns `ram` of allocation chunks to the free pool.
    pub(crate) fn release(&mut self, ram: Ram) {
        match self.allocated_ram.checked_sub(ram) {
            Some(remaining) => self.allocated_ram = remaining,
            None => {
                warn!(
                    hostname = %self.hostname,
                    allocated = %self.allocated_ram,
                    releasing = %ram,
                    "Releasing more RAM than allocated"
                );
                self.allocated_ram = Ram::ZERO;
            }
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Known workers, keyed by hostname.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, Worker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker. Fails if the hostname is already known.
    pub fn push_worker(&mut self, worker: Worker) -> MemoryResult<()> {
        if self.workers.contains_key(worker.hostname()) {
            return Err(MemoryError::DuplicateWorker(worker.hostname().to_string()));
        }
        debug!(
            hostname = %worker.hostname(),
            total_ram = %worker.total_ram(),
            free_ram = %worker.free_ram(),
            "Registered worker"
        );
        self.workers.insert(worker.hostname().to_string(), worker);
        Ok(())
    }

    pub fn get(&self, hostname: &str) -> Option<&Worker> {
        self.workers.get(hostname)
    }

    pub(crate) fn get_mut(&mut self, hostname: &str) -> Option<&mut Worker> {
        self.workers.get_mut(hostname)
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.workers.contains_key(hostname)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers in hostname order.
    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    /// Sum of free RAM over all workers.
    pub fn free_ram_total(&self) -> Ram {
        self.workers.values().map(Worker::free_ram).sum()
    }

    /// Refreshes a known worker in place.
    pub fn refresh_worker(
        &mut self,
        hostname: &str,
        total_ram: Ram,
        reserved_ram: Ram,
    ) -> MemoryResult<RefreshOutcome> {
        let worker = self
            .workers
            .get_mut(hostname)
            .ok_or_else(|| MemoryError::UnknownWorker(hostname.to_string()))?;
        let outcome = worker.refresh(total_ram, reserved_ram);
        if outcome.was_clamped() {
            warn!(
                hostname,
                reserved_clamped = %outcome.reserved_clamped,
                set_aside_clamped = %outcome.set_aside_clamped,
                "Worker refresh clamped to keep RAM invariant"
            );
        }
        Ok(outcome)
    }

    /// Updates a known worker's policy headroom.
    pub fn set_set_aside(&mut self, hostname: &str, ram: Ram) -> MemoryResult<()> {
        let worker = self
            .workers
            .get_mut(hostname)
            .ok_or_else(|| MemoryError::UnknownWorker(hostname.to_string()))?;
        worker.set_set_aside(ram);
        Ok(())
    }
}
