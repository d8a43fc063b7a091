//! The memory service loop.
//!
//! One task owns the [`MemoryAllocator`]; every mutation arrives as a
//! message on [`PortId::MEMORY`] and is applied in order. Between requests
//! the loop refreshes workers from the host and releases allocations whose
//! registered processes exited.

use std::sync::Arc;

use fleet_host::{Host, ProcessExit};
use fleet_id::PortId;
use fleet_memory::{
    Allocation, ChunkRequest, MemoryAllocator, MemoryError, OwnerTag, Ram, Worker,
};
use fleet_proto::{reply_message, MemoryRequest, MemoryResponse, Protocol, ServiceError};
use fleet_transport::{PortReader, Transport, WireMessage};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::config::MemoryConfig;
use crate::error::MemoryServiceError;

/// What one refresh pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub discovered: usize,
    pub refreshed: usize,
    pub clamped: usize,
}

/// Serves [`MemoryRequest`]s against a single allocator.
pub struct MemoryService<T> {
    allocator: MemoryAllocator,
    host: Arc<dyn Host>,
    transport: T,
    inbox: PortReader,
    config: MemoryConfig,
}

impl<T: Transport + Clone + 'static> MemoryService<T> {
    /// Binds the memory port. Requests sent after this returns are queued
    /// until [`run`](Self::run) starts.
    pub fn bind(
        host: Arc<dyn Host>,
        transport: T,
        config: MemoryConfig,
    ) -> Result<Self, MemoryServiceError> {
        Self::bind_port(host, transport, config, PortId::MEMORY)
    }

    pub fn bind_port(
        host: Arc<dyn Host>,
        transport: T,
        config: MemoryConfig,
        port: PortId,
    ) -> Result<Self, MemoryServiceError> {
        let inbox = transport.open(port)?;
        Ok(Self {
            allocator: MemoryAllocator::new(),
            host,
            transport,
            inbox,
            config,
        })
    }

    pub fn allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    /// Runs until shutdown is signaled.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), MemoryServiceError> {
        info!(
            port = %self.inbox.port(),
            refresh_ms = self.config.refresh_interval_ms,
            reap_ms = self.config.reap_interval_ms,
            "Starting memory service"
        );

        if let Err(e) = self.refresh_workers().await {
            warn!(error = %e, "Initial worker refresh failed");
        }

        let mut exits = Some(self.host.subscribe_exits());
        let mut refresh = tokio::time::interval(self.config.refresh_interval());
        let mut reap = tokio::time::interval(self.config.reap_interval());
        refresh.tick().await;
        reap.tick().await;

        loop {
            tokio::select! {
                frame = self.inbox.read() => {
                    match frame {
                        Some(Ok(message)) => self.handle(message).await,
                        Some(Err(e)) => warn!(error = %e, "Dropping malformed frame"),
                        None => {
                            info!("Memory port closed");
                            break;
                        }
                    }
                }
                exit = recv_exit(&mut exits) => {
                    match exit {
                        Ok(exit) => self.on_exit(&exit),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Exit stream lagged, sweeping");
                            self.reap().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Exit stream closed, relying on sweeps");
                            exits = None;
                        }
                    }
                }
                _ = refresh.tick() => {
                    if let Err(e) = self.refresh_workers().await {
                        error!(error = %e, "Worker refresh failed");
                    }
                }
                _ = reap.tick() => {
                    self.reap().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(
                            allocations = self.allocator.ledger().len(),
                            "Memory service shutting down"
                        );
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Requests
    // =========================================================================

    async fn handle(&mut self, message: WireMessage) {
        let reply_to = message.response_port;
        let request = match MemoryRequest::from_message(message) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Rejecting undecodable request");
                if let Some(port) = reply_to {
                    self.reply(port, &Err::<MemoryResponse, _>(ServiceError::from(e)));
                }
                return;
            }
        };

        if let Some(port) = reply_to {
            if !self.transport.is_open(port) {
                debug!(%port, request = %request.message_type(), "Skipping abandoned request");
                return;
            }
        }
        self.serve(request, reply_to);
    }

    /// Applies a request and replies to it. An allocation committed for a
    /// caller that left before the reply is released again.
    fn serve(&mut self, request: MemoryRequest, reply_to: Option<PortId>) {
        let creates_allocation = matches!(
            request,
            MemoryRequest::Allocate(_) | MemoryRequest::CommitPlan(_)
        );
        let result = self.apply(request);

        let Some(port) = reply_to else {
            if let Err(e) = &result {
                debug!(error = %e, "Request without reply port failed");
            }
            return;
        };
        if !self.reply(port, &result) && creates_allocation {
            // Nobody else knows the new id.
            if let Ok(MemoryResponse::Allocation(allocation)) = &result {
                self.release_orphan(allocation);
            }
        }
    }

    /// Applies one request to the allocator.
    pub fn apply(&mut self, request: MemoryRequest) -> Result<MemoryResponse, ServiceError> {
        let response = match request {
            MemoryRequest::Allocate(args) => {
                MemoryResponse::Allocation(self.allocate_with_retry(args.owner, &args.request)?)
            }
            MemoryRequest::CommitPlan(args) => {
                MemoryResponse::Allocation(self.allocator.allocate(args.owner, &args.plan)?)
            }
            MemoryRequest::ReleaseChunks(args) => {
                MemoryResponse::Remaining(self.allocator.release_chunks(args.id, args.ram)?)
            }
            MemoryRequest::ReleaseAll { id } => {
                MemoryResponse::Released(self.allocator.release_all(id)?)
            }
            MemoryRequest::ReleaseWorker(args) => {
                MemoryResponse::Remaining(self.allocator.release_worker(args.id, &args.hostname)?)
            }
            MemoryRequest::Transfer(args) => {
                MemoryResponse::Allocation(self.allocator.transfer(args.id, args.owner)?)
            }
            MemoryRequest::RegisterExitRelease(args) => {
                self.allocator
                    .register_exit_release(args.id, args.pid, args.scope)?;
                MemoryResponse::Registered
            }
            MemoryRequest::Snapshot => MemoryResponse::Snapshot(self.allocator.snapshot()),
            MemoryRequest::Capacity { chunk_size } => MemoryResponse::Capacity {
                chunk_size,
                max_chunks: self.allocator.max_chunks(chunk_size),
            },
            MemoryRequest::FreeRam => MemoryResponse::FreeRam(self.allocator.free_ram_total()),
        };
        Ok(response)
    }

    fn allocate_with_retry(
        &mut self,
        owner: OwnerTag,
        request: &ChunkRequest,
    ) -> Result<Allocation, MemoryError> {
        let mut attempt = 0;
        loop {
            let plan = self.allocator.plan(request)?;
            match self.allocator.allocate(owner.clone(), &plan) {
                Err(e) if e.is_conflict() && attempt < self.config.conflict_retries => {
                    attempt += 1;
                    debug!(%owner, attempt, error = %e, "Allocate conflicted, replanning");
                }
                result => return result,
            }
        }
    }

    /// Sends a reply. Returns false if the caller is gone.
    fn reply(&self, port: PortId, result: &Result<MemoryResponse, ServiceError>) -> bool {
        let message = match reply_message(result) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "Failed to encode reply");
                return true;
            }
        };
        match self.transport.try_send(port, message) {
            Ok(()) => true,
            Err(e) => {
                debug!(%port, error = %e, "Reply not delivered");
                !e.is_closed()
            }
        }
    }

    fn release_orphan(&mut self, allocation: &Allocation) {
        match self.allocator.release_all(allocation.id) {
            Ok(_) => warn!(
                allocation_id = %allocation.id,
                owner = %allocation.owner,
                "Released allocation for abandoned request"
            ),
            Err(e) => error!(allocation_id = %allocation.id, error = %e, "Orphan release failed"),
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Discovers new workers and refreshes known ones from the host.
    pub async fn refresh_workers(&mut self) -> Result<RefreshStats, MemoryServiceError> {
        let servers = self.host.list_servers().await?;
        let mut stats = RefreshStats::default();

        for server in servers.iter().filter(|s| s.is_worker()) {
            let set_aside = self.config.set_aside(&server.hostname);
            if self.allocator.workers().contains(&server.hostname) {
                let tracked = self.tracked_ram(&server.hostname).await?;
                let outcome = self.allocator.refresh_worker(
                    &server.hostname,
                    server.max_ram,
                    server.used_ram,
                    tracked,
                )?;
                if set_aside != self.worker_set_aside(&server.hostname) {
                    self.allocator.set_set_aside(&server.hostname, set_aside)?;
                }
                stats.refreshed += 1;
                if outcome.was_clamped() {
                    stats.clamped += 1;
                }
            } else {
                let worker = Worker::new(&server.hostname, server.max_ram)
                    .with_reserved(server.used_ram)
                    .with_set_aside(set_aside);
                info!(
                    hostname = %server.hostname,
                    total_ram = %worker.total_ram(),
                    free_ram = %worker.free_ram(),
                    "Discovered worker"
                );
                self.allocator.push_worker(worker)?;
                stats.discovered += 1;
            }
        }
        Ok(stats)
    }

    /// RAM of running processes on `hostname` registered to allocations.
    async fn tracked_ram(&self, hostname: &str) -> Result<Ram, MemoryServiceError> {
        let processes = self.host.processes(Some(hostname)).await?;
        Ok(processes
            .iter()
            .filter(|process| self.allocator.is_watched(process.pid))
            .map(|process| process.ram)
            .sum())
    }

    fn worker_set_aside(&self, hostname: &str) -> Ram {
        self.allocator
            .workers()
            .get(hostname)
            .map(Worker::set_aside_ram)
            .unwrap_or(Ram::ZERO)
    }

    fn on_exit(&mut self, exit: &ProcessExit) {
        let released = self.allocator.process_exited(exit.pid);
        if !released.is_empty() {
            debug!(pid = %exit.pid, hostname = %exit.hostname, ?released, "Applied exit releases");
        }
    }

    /// Releases registrations whose processes are no longer running.
    pub async fn reap(&mut self) -> usize {
        let mut reaped = 0;
        for pid in self.allocator.watched_pids() {
            match self.host.is_running(pid).await {
                Ok(false) => {
                    reaped += self.allocator.process_exited(pid).len();
                }
                Ok(true) => {}
                Err(e) => warn!(%pid, error = %e, "Could not check process"),
            }
        }
        if reaped > 0 {
            info!(reaped, "Reaped allocations of exited processes");
        }
        reaped
    }
}

async fn recv_exit(
    exits: &mut Option<broadcast::Receiver<ProcessExit>>,
) -> Result<ProcessExit, broadcast::error::RecvError> {
    match exits {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_host::{ServerDef, SimHost, World};
    use fleet_memory::ChunkRequest;
    use fleet_proto::{AllocateArgs, TransferArgs};
    use fleet_transport::PortTransport;

    async fn service() -> MemoryService<PortTransport> {
        let transport = PortTransport::default();
        let world = World {
            servers: vec![ServerDef {
                hostname: "alpha".to_string(),
                max_ram_gb: 32.0,
                used_ram_gb: 0.0,
                rooted: true,
            }],
            scripts: Vec::new(),
            targets: Vec::new(),
        };
        let host = SimHost::new(world, transport.clone());
        let mut service = MemoryService::bind(
            Arc::new(host),
            transport,
            MemoryConfig::default(),
        )
        .unwrap();
        service.refresh_workers().await.unwrap();
        service
    }

    fn closed_port(service: &MemoryService<PortTransport>) -> PortId {
        service.transport.open_ephemeral().port()
    }

    #[tokio::test]
    async fn test_undelivered_allocate_is_released() {
        let mut service = service().await;
        let port = closed_port(&service);

        service.serve(
            MemoryRequest::Allocate(AllocateArgs {
                owner: "gone".into(),
                request: ChunkRequest::new(Ram::from_gb(4), 2),
            }),
            Some(port),
        );
        assert!(service.allocator().ledger().is_empty());
        assert_eq!(service.allocator().free_ram_total(), Ram::from_gb(32));
    }

    #[tokio::test]
    async fn test_undelivered_transfer_keeps_allocation() {
        let mut service = service().await;
        let allocation = service
            .allocator
            .allocate_chunks("batcher".into(), &ChunkRequest::new(Ram::from_gb(4), 2))
            .unwrap();
        let port = closed_port(&service);

        service.serve(
            MemoryRequest::Transfer(TransferArgs {
                id: allocation.id,
                owner: "gone".into(),
            }),
            Some(port),
        );
        let kept = service.allocator().get(allocation.id).unwrap();
        assert_eq!(kept.owner, OwnerTag::from("gone"));
        assert_eq!(service.allocator().free_ram_total(), Ram::from_gb(24));
    }
}
