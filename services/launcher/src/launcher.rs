//! Placing script threads across workers.

use std::sync::Arc;

use fleet_host::{Host, HostError};
use fleet_id::{AllocationId, Pid};
use fleet_memory::{Allocation, ChunkRequest, ExitScope, Ram};
use fleet_proto::{LaunchArgs, LaunchResult, MemoryClient, Placement, ServiceError};
use fleet_transport::Transport;
use tracing::{debug, info, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::config::LaunchConfig;
use crate::error::LaunchError;

/// Turns launch requests into running processes.
///
/// A new allocation is sized as `threads` chunks of the script's RAM; each
/// worker's share becomes one process. Every started process is registered
/// with the memory service so its worker's chunks are released when it
/// exits. Workers that fail to start give their chunks back immediately.
pub struct Launcher<T: Transport + Clone + 'static> {
    host: Arc<dyn Host>,
    memory: MemoryClient<T>,
    backoff: BackoffPolicy,
    retry_limit: u32,
}

/// One process to start.
struct Slot {
    hostname: String,
    threads: u64,
}

impl<T: Transport + Clone + 'static> Launcher<T> {
    pub fn new(host: Arc<dyn Host>, transport: T, config: &LaunchConfig) -> Self {
        let memory = MemoryClient::new(transport).with_timeout(config.memory_timeout());
        Self::with_memory(host, memory, config)
    }

    pub fn with_memory(host: Arc<dyn Host>, memory: MemoryClient<T>, config: &LaunchConfig) -> Self {
        Self {
            host,
            memory,
            backoff: config.backoff(),
            retry_limit: config.retry_limit,
        }
    }

    #[instrument(skip_all, fields(script = %args.script, threads = args.threads, owner = %args.owner))]
    pub async fn launch(&self, args: LaunchArgs) -> Result<LaunchResult, LaunchError> {
        if args.threads == 0 {
            return Err(LaunchError::invalid("threads must be positive"));
        }
        if args.script.trim().is_empty() {
            return Err(LaunchError::invalid("script name is empty"));
        }
        let script_ram = self.host.script_ram(&args.script).await?;

        match args.allocation {
            Some(id) => self.launch_into(id, script_ram, &args).await,
            None => self.launch_new(script_ram, &args).await,
        }
    }

    /// Kills what a launch started. New allocations are released too.
    pub async fn abandon(&self, result: &LaunchResult, owns_allocation: bool) {
        for pid in result.started_pids() {
            self.kill_quietly(pid).await;
        }
        if owns_allocation {
            if let Err(e) = self.memory.release_all(result.allocation.id).await {
                warn!(allocation_id = %result.allocation.id, error = %e, "Release after abandon failed");
            }
        }
        warn!(
            allocation_id = %result.allocation.id,
            pids = result.started_pids().len(),
            "Abandoned launch cleaned up"
        );
    }

    async fn launch_new(&self, script_ram: Ram, args: &LaunchArgs) -> Result<LaunchResult, LaunchError> {
        let request = ChunkRequest {
            chunk_size: script_ram,
            chunk_count: args.threads,
            contiguous: args.contiguous,
        };
        let allocation = self
            .memory
            .allocate_planned(args.owner.clone(), request)
            .await?;
        let id = allocation.id;
        let guard = self.memory.guard(allocation.clone());

        let slots = allocation
            .chunks
            .iter()
            .map(|chunk| Slot {
                hostname: chunk.hostname.clone(),
                threads: chunk.threads,
            })
            .collect::<Vec<_>>();
        let placements = self.place(&slots, args, id, true).await;
        let started = started(&placements);

        if started.is_empty() || (args.all_or_nothing && started.len() < placements.len()) {
            for pid in started {
                self.kill_quietly(pid).await;
            }
            if let Err(e) = guard.release().await {
                warn!(allocation_id = %id, error = %e, "Release after failed launch failed");
            }
            return Err(failure(&args.script, &placements));
        }

        let mut allocation = guard.disarm().unwrap_or(allocation);
        for placement in placements.iter().filter(|p| p.pid.is_none()) {
            match self.memory.release_worker(id, placement.hostname.as_str()).await {
                Ok(Some(remaining)) => allocation = remaining,
                Ok(None) => {}
                Err(e) => warn!(
                    allocation_id = %id,
                    hostname = %placement.hostname,
                    error = %e,
                    "Could not release chunks of failed worker"
                ),
            }
        }

        info!(
            allocation_id = %id,
            started = started.len(),
            failed = placements.len() - started.len(),
            "Launched"
        );
        Ok(LaunchResult {
            allocation,
            placements,
        })
    }

    /// Starts processes inside an allocation the caller already holds. The
    /// caller keeps ownership: nothing is released here, and started
    /// processes are registered for tracking only.
    async fn launch_into(
        &self,
        id: AllocationId,
        script_ram: Ram,
        args: &LaunchArgs,
    ) -> Result<LaunchResult, LaunchError> {
        let snapshot = self.memory.snapshot().await?;
        let allocation = snapshot
            .allocations
            .into_iter()
            .find(|a| a.id == id)
            .ok_or_else(|| LaunchError::Memory(ServiceError::UnknownAllocation { id }.into()))?;

        if allocation.chunk_size < script_ram {
            return Err(LaunchError::invalid(format!(
                "allocation {id} has {} chunks, {} needs {script_ram}",
                allocation.chunk_size, args.script
            )));
        }
        let slots = slots_within(&allocation, args.threads, args.contiguous)?;
        let placements = self.place(&slots, args, id, false).await;
        let started = started(&placements);

        if started.is_empty() || (args.all_or_nothing && started.len() < placements.len()) {
            for pid in started {
                self.kill_quietly(pid).await;
            }
            return Err(failure(&args.script, &placements));
        }

        Ok(LaunchResult {
            allocation,
            placements,
        })
    }

    /// Starts one process per slot and registers each with allocation `id`.
    /// With `release_on_exit`, a process's exit releases its worker's chunks.
    async fn place(
        &self,
        slots: &[Slot],
        args: &LaunchArgs,
        id: AllocationId,
        release_on_exit: bool,
    ) -> Vec<Placement> {
        let mut placements = Vec::with_capacity(slots.len());

        for slot in slots {
            let outcome = match self.start(&args.script, slot, &args.args).await {
                Ok(pid) => {
                    let scope = if release_on_exit {
                        ExitScope::Worker(slot.hostname.clone())
                    } else {
                        ExitScope::Track
                    };
                    self.register(id, pid, scope).await
                }
                Err(e) => Err(e.to_string()),
            };

            let failed = outcome.is_err();
            placements.push(match outcome {
                Ok(pid) => Placement {
                    hostname: slot.hostname.clone(),
                    threads: slot.threads,
                    pid: Some(pid),
                    error: None,
                },
                Err(error) => {
                    warn!(hostname = %slot.hostname, %error, "Placement failed");
                    Placement {
                        hostname: slot.hostname.clone(),
                        threads: slot.threads,
                        pid: None,
                        error: Some(error),
                    }
                }
            });

            if failed && args.all_or_nothing {
                break;
            }
        }
        placements
    }

    /// Starts a process, retrying transient host failures with back-off.
    async fn start(&self, script: &str, slot: &Slot, args: &[String]) -> Result<Pid, HostError> {
        let mut attempt = 0;
        loop {
            match self
                .host
                .exec(script, &slot.hostname, slot.threads, args)
                .await
            {
                Ok(pid) => return Ok(pid),
                Err(e) if e.is_transient() && attempt < self.retry_limit => {
                    let delay = self.backoff.delay(attempt);
                    attempt += 1;
                    debug!(
                        hostname = %slot.hostname,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Exec failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Registers a started process with its allocation. A process that
    /// cannot be registered is stopped so its RAM is never unaccounted for.
    async fn register(&self, id: AllocationId, pid: Pid, scope: ExitScope) -> Result<Pid, String> {
        match self.memory.register_exit_release(id, pid, scope).await {
            Ok(()) => Ok(pid),
            Err(e) => {
                self.kill_quietly(pid).await;
                Err(format!("exit registration failed: {e}"))
            }
        }
    }

    async fn kill_quietly(&self, pid: Pid) {
        if let Err(e) = self.host.kill(pid).await {
            warn!(%pid, error = %e, "Kill failed");
        }
    }
}

/// Spreads `threads` over an existing allocation's chunks in order.
fn slots_within(allocation: &Allocation, threads: u64, contiguous: bool) -> Result<Vec<Slot>, LaunchError> {
    if contiguous {
        return allocation
            .chunks
            .iter()
            .find(|chunk| chunk.threads >= threads)
            .map(|chunk| {
                vec![Slot {
                    hostname: chunk.hostname.clone(),
                    threads,
                }]
            })
            .ok_or_else(|| {
                LaunchError::invalid(format!(
                    "no worker in allocation {} holds {threads} threads",
                    allocation.id
                ))
            });
    }

    if allocation.total_chunks() < threads {
        return Err(LaunchError::invalid(format!(
            "allocation {} holds {} threads, {threads} requested",
            allocation.id,
            allocation.total_chunks()
        )));
    }

    let mut remaining = threads;
    let mut slots = Vec::new();
    for chunk in &allocation.chunks {
        if remaining == 0 {
            break;
        }
        let take = chunk.threads.min(remaining);
        slots.push(Slot {
            hostname: chunk.hostname.clone(),
            threads: take,
        });
        remaining -= take;
    }
    Ok(slots)
}

fn started(placements: &[Placement]) -> Vec<Pid> {
    placements.iter().filter_map(|p| p.pid).collect()
}

fn failure(script: &str, placements: &[Placement]) -> LaunchError {
    let reason = placements
        .iter()
        .filter_map(|p| p.error.as_deref().map(|e| format!("{}: {e}", p.hostname)))
        .collect::<Vec<_>>()
        .join("; ");
    LaunchError::Failed {
        script: script.to_string(),
        reason: if reason.is_empty() {
            "no process started".to_string()
        } else {
            reason
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_memory::{Chunk, OwnerTag};

    fn allocation(chunks: &[(&str, u64)]) -> Allocation {
        Allocation {
            id: AllocationId::new(7),
            owner: OwnerTag::new("test"),
            chunk_size: Ram::from_gb(2),
            chunks: chunks
                .iter()
                .map(|(hostname, threads)| Chunk {
                    hostname: hostname.to_string(),
                    threads: *threads,
                })
                .collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_slots_fill_chunks_in_order() {
        let slots = slots_within(&allocation(&[("a", 3), ("b", 4)]), 5, false).unwrap();
        let shape: Vec<_> = slots.iter().map(|s| (s.hostname.as_str(), s.threads)).collect();
        assert_eq!(shape, vec![("a", 3), ("b", 2)]);
    }

    #[test]
    fn test_slots_reject_oversized_requests() {
        assert!(slots_within(&allocation(&[("a", 3)]), 4, false).is_err());
        assert!(slots_within(&allocation(&[("a", 3), ("b", 3)]), 4, true).is_err());
    }

    #[test]
    fn test_contiguous_slot_picks_first_fitting_chunk() {
        let slots = slots_within(&allocation(&[("a", 2), ("b", 6)]), 4, true).unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].hostname, "b");
    }

    #[test]
    fn test_failure_lists_worker_errors() {
        let placements = vec![
            Placement {
                hostname: "a".to_string(),
                threads: 1,
                pid: None,
                error: Some("boom".to_string()),
            },
            Placement {
                hostname: "b".to_string(),
                threads: 1,
                pid: Some(Pid::new(3)),
                error: None,
            },
        ];
        let err = failure("hack.js", &placements);
        assert_eq!(err.to_string(), "launch of hack.js failed: a: boom");
    }
}
