//! Memory service messages.

use fleet_id::{AllocationId, Pid};
use fleet_memory::{
    Allocation, AllocationPlan, ChunkRequest, ExitScope, MemorySnapshot, OwnerTag, Ram,
    ReleaseOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtoResult;
use crate::message::{payload, MessageType, Protocol};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocateArgs {
    pub owner: OwnerTag,
    #[serde(flatten)]
    pub request: ChunkRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitPlanArgs {
    pub owner: OwnerTag,
    pub plan: AllocationPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseChunksArgs {
    pub id: AllocationId,
    pub ram: Ram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseWorkerArgs {
    pub id: AllocationId,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferArgs {
    pub id: AllocationId,
    pub owner: OwnerTag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitReleaseArgs {
    pub id: AllocationId,
    pub pid: Pid,
    pub scope: ExitScope,
}

/// Requests the memory service serves.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryRequest {
    /// Plan and commit on the service side.
    Allocate(AllocateArgs),
    /// Commit a plan the caller computed from a snapshot.
    CommitPlan(CommitPlanArgs),
    ReleaseChunks(ReleaseChunksArgs),
    ReleaseAll { id: AllocationId },
    ReleaseWorker(ReleaseWorkerArgs),
    Transfer(TransferArgs),
    RegisterExitRelease(ExitReleaseArgs),
    Snapshot,
    Capacity { chunk_size: Ram },
    FreeRam,
}

#[derive(Serialize, Deserialize)]
struct IdArgs {
    id: AllocationId,
}

#[derive(Serialize, Deserialize)]
struct CapacityArgs {
    chunk_size: Ram,
}

impl MemoryRequest {
    /// Whether handling this request creates an allocation.
    pub fn creates_allocation(&self) -> bool {
        matches!(self, MemoryRequest::Allocate(_) | MemoryRequest::CommitPlan(_))
    }
}

impl Protocol for MemoryRequest {
    const SERVICE: &'static str = "memory service";

    fn message_type(&self) -> MessageType {
        match self {
            MemoryRequest::Allocate(_) => MessageType::Allocate,
            MemoryRequest::CommitPlan(_) => MessageType::CommitPlan,
            MemoryRequest::ReleaseChunks(_) => MessageType::ReleaseChunks,
            MemoryRequest::ReleaseAll { .. } => MessageType::ReleaseAll,
            MemoryRequest::ReleaseWorker(_) => MessageType::ReleaseWorker,
            MemoryRequest::Transfer(_) => MessageType::Transfer,
            MemoryRequest::RegisterExitRelease(_) => MessageType::RegisterExitRelease,
            MemoryRequest::Snapshot => MessageType::Snapshot,
            MemoryRequest::Capacity { .. } => MessageType::Capacity,
            MemoryRequest::FreeRam => MessageType::FreeRam,
        }
    }

    fn to_payload(&self) -> ProtoResult<Value> {
        let value = match self {
            MemoryRequest::Allocate(args) => serde_json::to_value(args)?,
            MemoryRequest::CommitPlan(args) => serde_json::to_value(args)?,
            MemoryRequest::ReleaseChunks(args) => serde_json::to_value(args)?,
            MemoryRequest::ReleaseAll { id } => serde_json::to_value(IdArgs { id: *id })?,
            MemoryRequest::ReleaseWorker(args) => serde_json::to_value(args)?,
            MemoryRequest::Transfer(args) => serde_json::to_value(args)?,
            MemoryRequest::RegisterExitRelease(args) => serde_json::to_value(args)?,
            MemoryRequest::Snapshot | MemoryRequest::FreeRam => Value::Null,
            MemoryRequest::Capacity { chunk_size } => serde_json::to_value(CapacityArgs {
                chunk_size: *chunk_size,
            })?,
        };
        Ok(value)
    }

    fn from_parts(message_type: MessageType, value: Value) -> ProtoResult<Self> {
        Ok(match message_type {
            MessageType::Allocate => MemoryRequest::Allocate(payload(value)?),
            MessageType::CommitPlan => MemoryRequest::CommitPlan(payload(value)?),
            MessageType::ReleaseChunks => MemoryRequest::ReleaseChunks(payload(value)?),
            MessageType::ReleaseAll => {
                let IdArgs { id } = payload(value)?;
                MemoryRequest::ReleaseAll { id }
            }
            MessageType::ReleaseWorker => MemoryRequest::ReleaseWorker(payload(value)?),
            MessageType::Transfer => MemoryRequest::Transfer(payload(value)?),
            MessageType::RegisterExitRelease => {
                MemoryRequest::RegisterExitRelease(payload(value)?)
            }
            MessageType::Snapshot => MemoryRequest::Snapshot,
            MessageType::Capacity => {
                let CapacityArgs { chunk_size } = payload(value)?;
                MemoryRequest::Capacity { chunk_size }
            }
            MessageType::FreeRam => MemoryRequest::FreeRam,
            MessageType::Launch
            | MessageType::PhaseStarted
            | MessageType::PhaseDone
            | MessageType::Reply => return Err(Self::unexpected(message_type)),
        })
    }
}

/// Answers from the memory service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MemoryResponse {
    /// A new or transferred allocation.
    Allocation(Allocation),
    /// What is left after a partial release; `None` once fully released.
    Remaining(Option<Allocation>),
    Released(ReleaseOutcome),
    Registered,
    Snapshot(MemorySnapshot),
    Capacity { chunk_size: Ram, max_chunks: u64 },
    FreeRam(Ram),
}

impl MemoryResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryResponse::Allocation(_) => "allocation",
            MemoryResponse::Remaining(_) => "remaining",
            MemoryResponse::Released(_) => "released",
            MemoryResponse::Registered => "registered",
            MemoryResponse::Snapshot(_) => "snapshot",
            MemoryResponse::Capacity { .. } => "capacity",
            MemoryResponse::FreeRam(_) => "free_ram",
        }
    }
}
