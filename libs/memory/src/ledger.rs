//! Bookkeeping of who holds which chunks.
//!
//! The ledger only records allocations; it never touches worker RAM. The
//! [`MemoryAllocator`](crate::MemoryAllocator) pairs every ledger change with
//! the matching worker update.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use fleet_id::{AllocationId, Pid};
use serde::{Deserialize, Serialize};

use crate::planner::AllocationPlan;
use crate::ram::Ram;

/// Opaque identifier of the client that owns an allocation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerTag(String);

impl OwnerTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerTag {
    fn from(tag: &str) -> Self {
        Self(tag.to_string())
    }
}

impl From<String> for OwnerTag {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

/// `threads` chunks placed on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub hostname: String,
    pub threads: u64,
}

/// A caller's reserved set of chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub owner: OwnerTag,
    pub chunk_size: Ram,
    /// In placement order; releases remove from the back.
    pub chunks: Vec<Chunk>,
    pub created_at: DateTime<Utc>,
}

impl Allocation {
    pub fn total_chunks(&self) -> u64 {
        self.chunks.iter().map(|c| c.threads).sum()
    }

    pub fn total_ram(&self) -> Ram {
        self.chunk_size.times(self.total_chunks())
    }

    pub fn is_empty(&self) -> bool {
        self.total_chunks() == 0
    }

    /// Chunks held on `hostname`.
    pub fn threads_on(&self, hostname: &str) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.hostname == hostname)
            .map(|c| c.threads)
            .sum()
    }

    pub fn ram_on(&self, hostname: &str) -> Ram {
        self.chunk_size.times(self.threads_on(hostname))
    }

    /// Distinct hostnames, in placement order.
    pub fn hostnames(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for chunk in &self.chunks {
            if !seen.contains(&chunk.hostname.as_str()) {
                seen.push(chunk.hostname.as_str());
            }
        }
        seen
    }
}

/// What to release when a registered process exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "hostname", rename_all = "snake_case")]
pub enum ExitScope {
    /// The whole allocation.
    Whole,
    /// Only the chunks on this worker.
    Worker(String),
    /// Nothing. The process only counts as running inside the allocation.
    Track,
}

/// Live allocations, the id counter, and exit registrations.
#[derive(Debug)]
pub struct AllocationLedger {
    allocations: BTreeMap<AllocationId, Allocation>,
    exit_hooks: BTreeMap<Pid, Vec<(AllocationId, ExitScope)>>,
    next_id: AllocationId,
}

impl Default for AllocationLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationLedger {
    pub fn new() -> Self {
        Self {
            allocations: BTreeMap::new(),
            exit_hooks: BTreeMap::new(),
            next_id: AllocationId::FIRST,
        }
    }

    /// Whether `id` was ever handed out (live or since released).
    pub fn was_issued(&self, id: AllocationId) -> bool {
        id >= AllocationId::FIRST && id < self.next_id
    }

    pub fn is_live(&self, id: AllocationId) -> bool {
        self.allocations.contains_key(&id)
    }

    pub fn get(&self, id: AllocationId) -> Option<&Allocation> {
        self.allocations.get(&id)
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.values()
    }

    pub fn owned_by<'a>(&'a self, owner: &'a OwnerTag) -> impl Iterator<Item = &'a Allocation> {
        self.allocations.values().filter(move |a| &a.owner == owner)
    }

    /// Exit registrations currently held for `pid`.
    pub fn exit_registrations(&self, pid: Pid) -> &[(AllocationId, ExitScope)] {
        self.exit_hooks.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Records a committed plan under a fresh id.
    pub(crate) fn insert(&mut self, owner: OwnerTag, plan: &AllocationPlan) -> &Allocation {
        let id = self.next_id;
        self.next_id = id.next();

        let chunks = plan
            .entries
            .iter()
            .filter(|e| e.chunks > 0)
            .map(|e| Chunk {
                hostname: e.hostname.clone(),
                threads: e.chunks,
            })
            .collect();

        self.allocations.entry(id).or_insert(Allocation {
            id,
            owner,
            chunk_size: plan.chunk_size,
            chunks,
            created_at: Utc::now(),
        })
    }

    /// Removes up to `count` chunks from the back of an allocation.
    pub(crate) fn take_tail(&mut self, id: AllocationId, count: u64) -> Vec<Chunk> {
        let Some(allocation) = self.allocations.get_mut(&id) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        let mut remaining = count;
        while remaining > 0 {
            let Some(last) = allocation.chunks.last_mut() else {
                break;
            };
            let take = last.threads.min(remaining);
            last.threads -= take;
            remaining -= take;
            removed.push(Chunk {
                hostname: last.hostname.clone(),
                threads: take,
            });
            if last.threads == 0 {
                allocation.chunks.pop();
            }
        }
        removed
    }

    /// Removes every chunk placed on `hostname`.
    pub(crate) fn take_worker(&mut self, id: AllocationId, hostname: &str) -> Vec<Chunk> {
        let Some(allocation) = self.allocations.get_mut(&id) else {
            return Vec::new();
        };
        let (removed, kept): (Vec<Chunk>, Vec<Chunk>) = allocation
            .chunks
            .drain(..)
            .partition(|c| c.hostname == hostname);
        allocation.chunks = kept;
        removed
    }

    /// Drops an allocation and every exit registration that names it.
    pub(crate) fn remove(&mut self, id: AllocationId) -> Option<Allocation> {
        let removed = self.allocations.remove(&id);
        if removed.is_some() {
            self.exit_hooks.retain(|_, hooks| {
                hooks.retain(|(hooked, _)| *hooked != id);
                !hooks.is_empty()
            });
        }
        removed
    }

    pub(crate) fn set_owner(&mut self, id: AllocationId, owner: OwnerTag) -> Option<&Allocation> {
        let allocation = self.allocations.get_mut(&id)?;
        allocation.owner = owner;
        Some(allocation)
    }

    pub(crate) fn add_exit_hook(&mut self, pid: Pid, id: AllocationId, scope: ExitScope) {
        let hooks = self.exit_hooks.entry(pid).or_default();
        if !hooks.iter().any(|(h, s)| *h == id && *s == scope) {
            hooks.push((id, scope));
        }
    }

    pub(crate) fn take_exit_hooks(&mut self, pid: Pid) -> Vec<(AllocationId, ExitScope)> {
        self.exit_hooks.remove(&pid).unwrap_or_default()
    }

    /// Pids with at least one exit registration.
    pub fn watched_pids(&self) -> Vec<Pid> {
        self.exit_hooks.keys().copied().collect()
    }
}
