//! Clients for the memory and launch services.
//!
//! [`ServiceClient`] holds the request/response mechanics once; the typed
//! clients only map requests to the response variant they expect.

use std::time::Duration;

use fleet_id::{AllocationId, PortId, Pid};
use fleet_memory::{
    Allocation, AllocationPlan, ChunkRequest, ExitScope, MemorySnapshot, OwnerTag, Ram,
    ReleaseOutcome,
};
use fleet_transport::{Transport, TransportError};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{ProtoError, ProtoResult, ServiceError};
use crate::launch::{LaunchArgs, LaunchRequest, LaunchResult};
use crate::memory::{
    AllocateArgs, CommitPlanArgs, ExitReleaseArgs, MemoryRequest, MemoryResponse,
    ReleaseChunksArgs, ReleaseWorkerArgs, TransferArgs,
};
use crate::message::{decode_reply, Protocol};

/// Default wait for a memory service reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for a launch reply; launches retry process starts.
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of fresh-snapshot retries after a commit conflict.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

// =============================================================================
// Generic client
// =============================================================================

/// Request/response against one service port.
#[derive(Debug, Clone)]
pub struct ServiceClient<T> {
    transport: T,
    port: PortId,
    timeout: Duration,
}

impl<T: Transport> ServiceClient<T> {
    pub fn new(transport: T, port: PortId) -> Self {
        Self {
            transport,
            port,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends `request` and waits for the typed answer.
    pub async fn call<Req, Resp>(&self, request: &Req) -> ProtoResult<Resp>
    where
        Req: Protocol + Sync,
        Resp: DeserializeOwned,
    {
        let message = request.to_message(None)?;
        let reply = self
            .transport
            .request(self.port, message, self.timeout)
            .await?;
        decode_reply(reply)
    }

    /// Sends `request` without asking for a reply.
    pub async fn notify<Req>(&self, request: &Req) -> ProtoResult<()>
    where
        Req: Protocol + Sync,
    {
        let message = request.to_message(None)?;
        self.transport.send(self.port, message).await?;
        Ok(())
    }

    /// Like [`notify`](Self::notify) but fails instead of waiting for space.
    pub fn try_notify<Req: Protocol>(&self, request: &Req) -> ProtoResult<()> {
        let message = request.to_message(None)?;
        self.transport.try_send(self.port, message)?;
        Ok(())
    }
}

fn unexpected(expected: &str, got: &MemoryResponse) -> ProtoError {
    ProtoError::UnexpectedReply(format!("expected {expected}, got {}", got.kind()))
}

// =============================================================================
// Memory client
// =============================================================================

/// Typed access to the memory service.
#[derive(Debug, Clone)]
pub struct MemoryClient<T> {
    inner: ServiceClient<T>,
    conflict_retries: u32,
}

impl<T: Transport> MemoryClient<T> {
    /// A client for the memory service on its well-known port.
    pub fn new(transport: T) -> Self {
        Self::with_port(transport, PortId::MEMORY)
    }

    pub fn with_port(transport: T, port: PortId) -> Self {
        Self {
            inner: ServiceClient::new(transport, port),
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.inner = self.inner.with_timeout(timeout);
        self
    }

    #[must_use]
    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn service(&self) -> &ServiceClient<T> {
        &self.inner
    }

    async fn call(&self, request: MemoryRequest) -> ProtoResult<MemoryResponse> {
        self.inner.call(&request).await
    }

    /// Lets the service plan and commit.
    pub async fn allocate(&self, owner: OwnerTag, request: ChunkRequest) -> ProtoResult<Allocation> {
        match self
            .call(MemoryRequest::Allocate(AllocateArgs { owner, request }))
            .await?
        {
            MemoryResponse::Allocation(allocation) => Ok(allocation),
            other => Err(unexpected("allocation", &other)),
        }
    }

    /// Plans locally against a snapshot and commits, retrying with a fresh
    /// snapshot when another caller got there first.
    pub async fn allocate_planned(
        &self,
        owner: OwnerTag,
        request: ChunkRequest,
    ) -> ProtoResult<Allocation> {
        let mut attempt = 0;
        loop {
            let snapshot = self.snapshot().await?;
            let plan = snapshot
                .plan(&request)
                .map_err(|e| ProtoError::Service(e.into()))?;

            match self.commit_plan(owner.clone(), plan).await {
                Err(e) if e.is_conflict() && attempt < self.conflict_retries => {
                    attempt += 1;
                    debug!(%owner, attempt, error = %e, "Commit conflicted, replanning");
                }
                result => return result,
            }
        }
    }

    pub async fn commit_plan(
        &self,
        owner: OwnerTag,
        plan: AllocationPlan,
    ) -> ProtoResult<Allocation> {
        match self
            .call(MemoryRequest::CommitPlan(CommitPlanArgs { owner, plan }))
            .await?
        {
            MemoryResponse::Allocation(allocation) => Ok(allocation),
            other => Err(unexpected("allocation", &other)),
        }
    }

    pub async fn release_chunks(
        &self,
        id: AllocationId,
        ram: Ram,
    ) -> ProtoResult<Option<Allocation>> {
        match self
            .call(MemoryRequest::ReleaseChunks(ReleaseChunksArgs { id, ram }))
            .await?
        {
            MemoryResponse::Remaining(remaining) => Ok(remaining),
            other => Err(unexpected("remaining", &other)),
        }
    }

    pub async fn release_all(&self, id: AllocationId) -> ProtoResult<ReleaseOutcome> {
        match self.call(MemoryRequest::ReleaseAll { id }).await? {
            MemoryResponse::Released(outcome) => Ok(outcome),
            other => Err(unexpected("released", &other)),
        }
    }

    /// Fire-and-forget full release; never waits.
    pub fn release_all_detached(&self, id: AllocationId)
    where
        T: Clone + 'static,
    {
        release_detached(self.inner.transport(), self.inner.port(), id);
    }

    pub async fn release_worker(
        &self,
        id: AllocationId,
        hostname: impl Into<String>,
    ) -> ProtoResult<Option<Allocation>> {
        let args = ReleaseWorkerArgs {
            id,
            hostname: hostname.into(),
        };
        match self.call(MemoryRequest::ReleaseWorker(args)).await? {
            MemoryResponse::Remaining(remaining) => Ok(remaining),
            other => Err(unexpected("remaining", &other)),
        }
    }

    pub async fn transfer(&self, id: AllocationId, owner: OwnerTag) -> ProtoResult<Allocation> {
        match self
            .call(MemoryRequest::Transfer(TransferArgs { id, owner }))
            .await?
        {
            MemoryResponse::Allocation(allocation) => Ok(allocation),
            other => Err(unexpected("allocation", &other)),
        }
    }

    pub async fn register_exit_release(
        &self,
        id: AllocationId,
        pid: Pid,
        scope: ExitScope,
    ) -> ProtoResult<()> {
        let args = ExitReleaseArgs { id, pid, scope };
        match self.call(MemoryRequest::RegisterExitRelease(args)).await? {
            MemoryResponse::Registered => Ok(()),
            other => Err(unexpected("registered", &other)),
        }
    }

    pub async fn snapshot(&self) -> ProtoResult<MemorySnapshot> {
        match self.call(MemoryRequest::Snapshot).await? {
            MemoryResponse::Snapshot(snapshot) => Ok(snapshot),
            other => Err(unexpected("snapshot", &other)),
        }
    }

    /// How many chunks of `chunk_size` fit right now.
    pub async fn capacity(&self, chunk_size: Ram) -> ProtoResult<u64> {
        match self.call(MemoryRequest::Capacity { chunk_size }).await? {
            MemoryResponse::Capacity { max_chunks, .. } => Ok(max_chunks),
            other => Err(unexpected("capacity", &other)),
        }
    }

    pub async fn free_ram(&self) -> ProtoResult<Ram> {
        match self.call(MemoryRequest::FreeRam).await? {
            MemoryResponse::FreeRam(ram) => Ok(ram),
            other => Err(unexpected("free_ram", &other)),
        }
    }

    /// Wraps `allocation` so it is released when the guard drops.
    pub fn guard(&self, allocation: Allocation) -> AllocationGuard<T>
    where
        T: Clone + 'static,
    {
        AllocationGuard {
            allocation: Some(allocation),
            client: self.clone(),
        }
    }
}

fn release_detached<T>(transport: &T, port: PortId, id: AllocationId)
where
    T: Transport + Clone + 'static,
{
    let message = match (MemoryRequest::ReleaseAll { id }).to_message(None) {
        Ok(message) => message,
        Err(e) => {
            warn!(allocation_id = %id, error = %e, "Failed to encode release");
            return;
        }
    };

    match transport.try_send(port, message.clone()) {
        Ok(()) => debug!(allocation_id = %id, "Queued release"),
        Err(TransportError::Full(_)) => match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let transport = transport.clone();
                handle.spawn(async move {
                    if let Err(e) = transport.send(port, message).await {
                        warn!(allocation_id = %id, error = %e, "Deferred release failed");
                    }
                });
            }
            Err(_) => {
                warn!(allocation_id = %id, "Port full and no runtime; release left to exit hooks")
            }
        },
        Err(e) => warn!(allocation_id = %id, error = %e, "Failed to queue release"),
    }
}

// =============================================================================
// Allocation guard
// =============================================================================

/// Releases its allocation when dropped, on every exit path.
///
/// Use [`release`](Self::release) to release and observe the result, or
/// [`disarm`](Self::disarm) to keep the allocation alive past the guard.
#[derive(Debug)]
pub struct AllocationGuard<T: Transport + Clone + 'static> {
    allocation: Option<Allocation>,
    client: MemoryClient<T>,
}

impl<T: Transport + Clone + 'static> AllocationGuard<T> {
    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    pub fn id(&self) -> Option<AllocationId> {
        self.allocation.as_ref().map(|a| a.id)
    }

    /// Releases now and waits for the service.
    pub async fn release(mut self) -> ProtoResult<ReleaseOutcome> {
        match self.allocation.take() {
            Some(allocation) => self.client.release_all(allocation.id).await,
            None => Ok(ReleaseOutcome::AlreadyReleased),
        }
    }

    /// Gives up ownership without releasing.
    pub fn disarm(mut self) -> Option<Allocation> {
        self.allocation.take()
    }
}

impl<T: Transport + Clone + 'static> Drop for AllocationGuard<T> {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.client.release_all_detached(allocation.id);
        }
    }
}

// =============================================================================
// Launch client
// =============================================================================

/// Typed access to the launch service.
#[derive(Debug, Clone)]
pub struct LaunchClient<T> {
    inner: ServiceClient<T>,
}

impl<T: Transport> LaunchClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: ServiceClient::new(transport, PortId::LAUNCH).with_timeout(DEFAULT_LAUNCH_TIMEOUT),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.inner = self.inner.with_timeout(timeout);
        self
    }

    pub async fn launch(&self, args: LaunchArgs) -> ProtoResult<LaunchResult> {
        if args.threads == 0 {
            return Err(ServiceError::invalid("threads must be positive").into());
        }
        self.inner.call(&LaunchRequest::Launch(args)).await
    }
}
