//! The allocator: registry plus ledger, mutated together.

use fleet_id::{AllocationId, Pid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{MemoryError, MemoryResult};
use crate::ledger::{Allocation, AllocationLedger, Chunk, ExitScope, OwnerTag};
use crate::planner::{plan_for_workers, max_chunks_for_workers, AllocationPlan, ChunkRequest};
use crate::ram::Ram;
use crate::snapshot::MemorySnapshot;
use crate::worker::{RefreshOutcome, Worker, WorkerRegistry};

/// Result of a full release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// The allocation was live and `freed` RAM went back to its workers.
    Released { freed: Ram },
    /// The id was issued earlier and is already gone.
    AlreadyReleased,
}

/// Owns every [`Worker`] and [`Allocation`] record.
///
/// Callers are expected to serialize access (the memory service runs it on a
/// single task). Plans built from an older [`MemorySnapshot`] are re-checked
/// at commit.
#[derive(Debug, Default)]
pub struct MemoryAllocator {
    registry: WorkerRegistry,
    ledger: AllocationLedger,
    version: u64,
}

impl MemoryAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an allocator over an initial set of workers.
    pub fn with_workers(workers: impl IntoIterator<Item = Worker>) -> MemoryResult<Self> {
        let mut allocator = Self::new();
        for worker in workers {
            allocator.push_worker(worker)?;
        }
        Ok(allocator)
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &AllocationLedger {
        &self.ledger
    }

    /// Bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    // =========================================================================
    // Workers
    // =========================================================================

    pub fn push_worker(&mut self, worker: Worker) -> MemoryResult<()> {
        self.registry.push_worker(worker)?;
        self.version += 1;
        Ok(())
    }

    /// Refreshes a worker from host-reported totals.
    ///
    /// `used_ram` is everything running on the host. `tracked_ram` is the
    /// part held by processes registered to allocations; the rest counts as
    /// reserved, even where it sits inside chunks no process occupies yet.
    pub fn refresh_worker(
        &mut self,
        hostname: &str,
        total_ram: Ram,
        used_ram: Ram,
        tracked_ram: Ram,
    ) -> MemoryResult<RefreshOutcome> {
        let reserved = used_ram.saturating_sub(tracked_ram);
        let outcome = self.registry.refresh_worker(hostname, total_ram, reserved)?;
        self.version += 1;
        Ok(outcome)
    }

    pub fn set_set_aside(&mut self, hostname: &str, ram: Ram) -> MemoryResult<()> {
        self.registry.set_set_aside(hostname, ram)?;
        self.version += 1;
        Ok(())
    }

    pub fn free_ram_total(&self) -> Ram {
        self.registry.free_ram_total()
    }

    // =========================================================================
    // Planning
    // =========================================================================

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot::new(
            self.registry.iter().cloned().collect(),
            self.ledger.iter().cloned().collect(),
        )
        .with_version(self.version)
    }

    pub fn max_chunks(&self, chunk_size: Ram) -> u64 {
        max_chunks_for_workers(self.registry.iter(), chunk_size)
    }

    /// Plans against current state without committing.
    pub fn plan(&self, request: &ChunkRequest) -> MemoryResult<AllocationPlan> {
        plan_for_workers(self.registry.iter(), request)
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Commits a plan as a new allocation.
    ///
    /// Every worker in the plan is checked before any is touched, so a
    /// conflicting plan leaves no trace.
    pub fn allocate(&mut self, owner: OwnerTag, plan: &AllocationPlan) -> MemoryResult<Allocation> {
        if plan.chunk_size.is_zero() {
            return Err(MemoryError::InvalidArgument(
                "chunk size must be positive".to_string(),
            ));
        }
        if plan.is_empty() {
            return Err(MemoryError::InvalidArgument(
                "plan places no chunks".to_string(),
            ));
        }

        let required = plan.ram_by_worker();
        for (hostname, ram) in &required {
            let available = self
                .registry
                .get(hostname)
                .map(Worker::free_ram)
                .unwrap_or(Ram::ZERO);
            if !self.registry.contains(hostname) || *ram > available {
                debug!(%hostname, required = %ram, %available, "Plan conflicts with current state");
                return Err(MemoryError::AllocationConflict {
                    hostname: hostname.to_string(),
                    required: *ram,
                    available,
                });
            }
        }

        for (hostname, ram) in &required {
            if let Some(worker) = self.registry.get_mut(hostname) {
                worker.place(*ram)?;
            }
        }
        self.version += 1;

        let allocation = self.ledger.insert(owner, plan).clone();
        info!(
            allocation_id = %allocation.id,
            owner = %allocation.owner,
            chunk_size = %allocation.chunk_size,
            chunks = allocation.total_chunks(),
            workers = allocation.chunks.len(),
            "Allocation committed"
        );
        Ok(allocation)
    }

    /// Plans against current state and commits in one step.
    pub fn allocate_chunks(
        &mut self,
        owner: OwnerTag,
        request: &ChunkRequest,
    ) -> MemoryResult<Allocation> {
        let plan = self.plan(request)?;
        self.allocate(owner, &plan)
    }

    // =========================================================================
    // Release
    // =========================================================================

    /// Releases chunks from the back of an allocation until at least
    /// `ram_to_release` is freed.
    ///
    /// Returns the remaining allocation, or `None` once it is fully released
    /// (including when it already was).
    pub fn release_chunks(
        &mut self,
        id: AllocationId,
        ram_to_release: Ram,
    ) -> MemoryResult<Option<Allocation>> {
        let Some(chunk_size) = self.live_chunk_size(id)? else {
            return Ok(None);
        };

        let count = ram_to_release.chunks_covering(chunk_size);
        let removed = self.ledger.take_tail(id, count);
        let freed = self.return_chunks(chunk_size, &removed);
        debug!(allocation_id = %id, requested = %ram_to_release, %freed, "Released chunks");

        Ok(self.finish_partial_release(id))
    }

    /// Releases a whole allocation. Releasing an already released id is a
    /// no-op.
    pub fn release_all(&mut self, id: AllocationId) -> MemoryResult<ReleaseOutcome> {
        let Some(chunk_size) = self.live_chunk_size(id)? else {
            return Ok(ReleaseOutcome::AlreadyReleased);
        };

        let Some(allocation) = self.ledger.remove(id) else {
            return Ok(ReleaseOutcome::AlreadyReleased);
        };
        let freed = self.return_chunks(chunk_size, &allocation.chunks);
        self.version += 1;
        info!(allocation_id = %id, owner = %allocation.owner, %freed, "Allocation released");
        Ok(ReleaseOutcome::Released { freed })
    }

    /// Releases the chunks an allocation holds on one worker.
    pub fn release_worker(
        &mut self,
        id: AllocationId,
        hostname: &str,
    ) -> MemoryResult<Option<Allocation>> {
        let Some(chunk_size) = self.live_chunk_size(id)? else {
            return Ok(None);
        };

        let removed = self.ledger.take_worker(id, hostname);
        let freed = self.return_chunks(chunk_size, &removed);
        debug!(allocation_id = %id, %hostname, %freed, "Released worker chunks");

        Ok(self.finish_partial_release(id))
    }

    /// Hands a live allocation to another owner.
    pub fn transfer(&mut self, id: AllocationId, owner: OwnerTag) -> MemoryResult<Allocation> {
        let previous = self
            .ledger
            .get(id)
            .map(|a| a.owner.clone())
            .ok_or(MemoryError::UnknownAllocation(id))?;
        let allocation = self
            .ledger
            .set_owner(id, owner)
            .cloned()
            .ok_or(MemoryError::UnknownAllocation(id))?;
        self.version += 1;
        info!(allocation_id = %id, from = %previous, to = %allocation.owner, "Allocation transferred");
        Ok(allocation)
    }

    // =========================================================================
    // Exit-scoped release
    // =========================================================================

    /// Arranges for `scope` of allocation `id` to be released when `pid`
    /// exits.
    pub fn register_exit_release(
        &mut self,
        id: AllocationId,
        pid: Pid,
        scope: ExitScope,
    ) -> MemoryResult<()> {
        if !self.ledger.is_live(id) {
            return Err(MemoryError::UnknownAllocation(id));
        }
        debug!(allocation_id = %id, %pid, ?scope, "Registered exit release");
        self.ledger.add_exit_hook(pid, id, scope);
        Ok(())
    }

    /// Applies every exit registration for `pid`. Returns the allocations
    /// that lost RAM.
    pub fn process_exited(&mut self, pid: Pid) -> Vec<AllocationId> {
        let mut touched = Vec::new();
        for (id, scope) in self.ledger.take_exit_hooks(pid) {
            let result = match &scope {
                ExitScope::Whole => self
                    .release_all(id)
                    .map(|outcome| matches!(outcome, ReleaseOutcome::Released { .. })),
                ExitScope::Worker(hostname) => {
                    let before = self.ledger.get(id).map(|a| a.threads_on(hostname));
                    self.release_worker(id, hostname)
                        .map(|_| before.unwrap_or(0) > 0)
                }
                ExitScope::Track => Ok(false),
            };
            match result {
                Ok(true) => touched.push(id),
                Ok(false) => {}
                Err(e) => warn!(allocation_id = %id, %pid, error = %e, "Exit release failed"),
            }
        }
        if !touched.is_empty() {
            info!(%pid, allocations = touched.len(), "Released allocations for exited process");
        }
        touched
    }

    /// Pids with pending exit registrations.
    pub fn watched_pids(&self) -> Vec<Pid> {
        self.ledger.watched_pids()
    }

    pub fn is_watched(&self, pid: Pid) -> bool {
        !self.ledger.exit_registrations(pid).is_empty()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get(&self, id: AllocationId) -> Option<&Allocation> {
        self.ledger.get(id)
    }

    pub fn allocations_for_owner(&self, owner: &OwnerTag) -> Vec<Allocation> {
        self.ledger.owned_by(owner).cloned().collect()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// `Ok(Some(chunk_size))` for a live id, `Ok(None)` for a released one.
    fn live_chunk_size(&self, id: AllocationId) -> MemoryResult<Option<Ram>> {
        if !self.ledger.was_issued(id) {
            return Err(MemoryError::UnknownAllocation(id));
        }
        Ok(self.ledger.get(id).map(|a| a.chunk_size))
    }

    fn return_chunks(&mut self, chunk_size: Ram, chunks: &[Chunk]) -> Ram {
        let mut freed = Ram::ZERO;
        for chunk in chunks {
            let ram = chunk_size.times(chunk.threads);
            match self.registry.get_mut(&chunk.hostname) {
                Some(worker) => worker.release(ram),
                None => warn!(hostname = %chunk.hostname, %ram, "Releasing chunks on unknown worker"),
            }
            freed += ram;
        }
        freed
    }

    fn finish_partial_release(&mut self, id: AllocationId) -> Option<Allocation> {
        self.version += 1;
        let empty = self.ledger.get(id).map(Allocation::is_empty).unwrap_or(true);
        if empty {
            if let Some(allocation) = self.ledger.remove(id) {
                info!(allocation_id = %id, owner = %allocation.owner, "Allocation fully released");
            }
            return None;
        }
        self.ledger.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gb(n: u64) -> Ram {
        Ram::from_gb(n)
    }

    fn allocator(workers: &[(&str, u64)]) -> MemoryAllocator {
        MemoryAllocator::with_workers(workers.iter().map(|(h, g)| Worker::new(*h, gb(*g)))).unwrap()
    }

    #[test]
    fn test_allocate_drains_single_worker() {
        let mut alloc = allocator(&[("big", 32)]);
        let allocation = alloc
            .allocate_chunks("client".into(), &ChunkRequest::new(gb(4), 8))
            .unwrap();

        assert_eq!(allocation.id, AllocationId::FIRST);
        assert_eq!(allocation.total_chunks(), 8);
        assert_eq!(alloc.free_ram_total(), Ram::ZERO);
        assert_eq!(alloc.workers().get("big").unwrap().allocated_ram(), gb(32));
    }

    #[test]
    fn test_stale_plan_conflicts_without_side_effects() {
        let mut alloc = allocator(&[("a", 8), ("b", 8)]);
        let stale = alloc.snapshot();
        let plan = stale.plan(&ChunkRequest::new(gb(4), 4)).unwrap();

        alloc
            .allocate_chunks("other".into(), &ChunkRequest::new(gb(4), 1))
            .unwrap();
        let before = alloc.snapshot();

        let err = alloc.allocate("late".into(), &plan).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(alloc.snapshot().workers, before.workers);
        assert_eq!(alloc.ledger().len(), 1);
    }

    #[test]
    fn test_plan_naming_unknown_worker_conflicts() {
        let mut alloc = allocator(&[("a", 8)]);
        let plan = AllocationPlan {
            chunk_size: gb(1),
            entries: vec![crate::PlanEntry {
                hostname: "ghost".into(),
                chunks: 1,
            }],
        };
        assert!(alloc.allocate("o".into(), &plan).unwrap_err().is_conflict());
    }

    #[test]
    fn test_release_chunks_lifo_and_rounds_up() {
        let mut alloc = allocator(&[("a", 8), ("b", 4)]);
        let allocation = alloc
            .allocate_chunks("o".into(), &ChunkRequest::new(gb(2), 6))
            .unwrap();
        assert_eq!(allocation.threads_on("a"), 4);
        assert_eq!(allocation.threads_on("b"), 2);

        // 3GB of 2GB chunks frees two chunks, both from the last worker.
        let remaining = alloc
            .release_chunks(allocation.id, gb(3))
            .unwrap()
            .unwrap();
        assert_eq!(remaining.total_chunks(), 4);
        assert_eq!(remaining.threads_on("b"), 0);
        assert_eq!(alloc.workers().get("b").unwrap().allocated_ram(), Ram::ZERO);

        let remaining = alloc.release_chunks(allocation.id, gb(100)).unwrap();
        assert!(remaining.is_none());
        assert_eq!(alloc.free_ram_total(), gb(12));

        // Fully released: further releases are no-ops.
        assert!(alloc.release_chunks(allocation.id, gb(2)).unwrap().is_none());
    }

    #[test]
    fn test_unknown_ids_are_errors() {
        let mut alloc = allocator(&[("a", 8)]);
        let never = AllocationId::new(42);
        assert_eq!(
            alloc.release_chunks(never, gb(1)).unwrap_err(),
            MemoryError::UnknownAllocation(never)
        );
        assert!(alloc.release_all(never).is_err());
        assert!(alloc.release_worker(never, "a").is_err());
        assert!(alloc.transfer(never, "x".into()).is_err());
    }

    #[test]
    fn test_release_all_is_idempotent() {
        let mut alloc = allocator(&[("a", 8)]);
        let id = alloc
            .allocate_chunks("o".into(), &ChunkRequest::new(gb(1), 3))
            .unwrap()
            .id;

        assert_eq!(
            alloc.release_all(id).unwrap(),
            ReleaseOutcome::Released { freed: gb(3) }
        );
        let after_first = alloc.snapshot().workers;
        assert_eq!(alloc.release_all(id).unwrap(), ReleaseOutcome::AlreadyReleased);
        assert_eq!(alloc.snapshot().workers, after_first);
    }

    #[test]
    fn test_release_worker_keeps_other_chunks() {
        let mut alloc = allocator(&[("a", 4), ("b", 4)]);
        let id = alloc
            .allocate_chunks("o".into(), &ChunkRequest::new(gb(1), 6))
            .unwrap()
            .id;

        let remaining = alloc.release_worker(id, "a").unwrap().unwrap();
        assert_eq!(remaining.hostnames(), vec!["b"]);
        assert_eq!(alloc.workers().get("a").unwrap().allocated_ram(), Ram::ZERO);

        assert!(alloc.release_worker(id, "b").unwrap().is_none());
        assert!(alloc.get(id).is_none());
    }

    #[test]
    fn test_transfer_changes_owner() {
        let mut alloc = allocator(&[("a", 4)]);
        let id = alloc
            .allocate_chunks("first".into(), &ChunkRequest::new(gb(1), 1))
            .unwrap()
            .id;
        alloc.transfer(id, "second".into()).unwrap();

        assert!(alloc.allocations_for_owner(&"first".into()).is_empty());
        assert_eq!(alloc.allocations_for_owner(&"second".into()).len(), 1);
    }

    #[test]
    fn test_process_exit_releases_registered_scope() {
        let mut alloc = allocator(&[("a", 4), ("b", 4)]);
        let id = alloc
            .allocate_chunks("o".into(), &ChunkRequest::new(gb(1), 8))
            .unwrap()
            .id;
        alloc
            .register_exit_release(id, Pid::new(10), ExitScope::Worker("a".into()))
            .unwrap();
        alloc
            .register_exit_release(id, Pid::new(11), ExitScope::Worker("b".into()))
            .unwrap();

        assert_eq!(alloc.process_exited(Pid::new(10)), vec![id]);
        assert_eq!(alloc.free_ram_total(), gb(4));
        assert_eq!(alloc.process_exited(Pid::new(10)), Vec::<AllocationId>::new());

        assert_eq!(alloc.process_exited(Pid::new(11)), vec![id]);
        assert_eq!(alloc.free_ram_total(), gb(8));
        assert!(alloc.get(id).is_none());
        assert!(alloc.watched_pids().is_empty());
    }

    #[test]
    fn test_whole_scope_after_manual_release_is_dropped() {
        let mut alloc = allocator(&[("a", 4)]);
        let id = alloc
            .allocate_chunks("o".into(), &ChunkRequest::new(gb(1), 2))
            .unwrap()
            .id;
        alloc
            .register_exit_release(id, Pid::new(3), ExitScope::Whole)
            .unwrap();
        alloc.release_all(id).unwrap();

        assert!(alloc.watched_pids().is_empty());
        assert!(alloc.process_exited(Pid::new(3)).is_empty());
        assert!(alloc
            .register_exit_release(id, Pid::new(3), ExitScope::Whole)
            .is_err());
    }

    #[test]
    fn test_track_scope_releases_nothing_on_exit() {
        let mut alloc = allocator(&[("a", 8)]);
        let id = alloc
            .allocate_chunks("o".into(), &ChunkRequest::new(gb(2), 2))
            .unwrap()
            .id;
        alloc
            .register_exit_release(id, Pid::new(5), ExitScope::Track)
            .unwrap();
        assert!(alloc.is_watched(Pid::new(5)));

        assert!(alloc.process_exited(Pid::new(5)).is_empty());
        assert!(!alloc.is_watched(Pid::new(5)));
        assert_eq!(alloc.get(id).unwrap().total_chunks(), 2);
    }

    #[test]
    fn test_refresh_counts_untracked_usage_as_reserved() {
        let mut alloc = allocator(&[("a", 16)]);
        alloc
            .allocate_chunks("o".into(), &ChunkRequest::new(gb(4), 1))
            .unwrap();

        // Host reports 6GB used: 4GB from a registered process, 2GB foreign.
        alloc.refresh_worker("a", gb(16), gb(6), gb(4)).unwrap();
        let worker = alloc.workers().get("a").unwrap();
        assert_eq!(worker.reserved_ram(), gb(2));
        assert_eq!(worker.free_ram(), gb(10));
        assert!(alloc.refresh_worker("ghost", gb(1), Ram::ZERO, Ram::ZERO).is_err());
    }

    #[test]
    fn test_idle_allocation_does_not_hide_foreign_usage() {
        let mut alloc = allocator(&[("a", 32)]);
        alloc
            .allocate_chunks("idle".into(), &ChunkRequest::new(gb(4), 2))
            .unwrap();

        // 8GB foreign, nothing launched into the allocation yet.
        alloc.refresh_worker("a", gb(32), gb(8), Ram::ZERO).unwrap();
        assert_eq!(alloc.free_ram_total(), gb(16));
        let err = alloc
            .allocate_chunks("late".into(), &ChunkRequest::new(gb(4), 6))
            .unwrap_err();
        assert!(matches!(err, MemoryError::InsufficientCapacity { satisfiable: 4, .. }));
    }

    #[test]
    fn test_version_advances_on_mutation() {
        let mut alloc = allocator(&[("a", 4)]);
        let v0 = alloc.version();
        alloc
            .allocate_chunks("o".into(), &ChunkRequest::new(gb(1), 1))
            .unwrap();
        assert!(alloc.version() > v0);
        assert_eq!(alloc.snapshot().version, alloc.version());
    }
}
