//! Launch service messages.

use fleet_id::{AllocationId, Pid};
use fleet_memory::{Allocation, OwnerTag};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtoResult;
use crate::message::{payload, MessageType, Protocol};

/// Run `script` with `threads` threads somewhere in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchArgs {
    pub script: String,
    pub threads: u64,
    #[serde(default)]
    pub args: Vec<String>,
    pub owner: OwnerTag,
    /// All threads in one process on one worker.
    #[serde(default)]
    pub contiguous: bool,
    /// Fail (and release everything) if any worker fails to start.
    #[serde(default)]
    pub all_or_nothing: bool,
    /// Launch into an allocation the caller already holds instead of
    /// requesting a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationId>,
}

impl LaunchArgs {
    pub fn new(script: impl Into<String>, threads: u64, owner: impl Into<OwnerTag>) -> Self {
        Self {
            script: script.into(),
            threads,
            args: Vec::new(),
            owner: owner.into(),
            contiguous: false,
            all_or_nothing: false,
            allocation: None,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn contiguous(mut self) -> Self {
        self.contiguous = true;
        self
    }

    #[must_use]
    pub fn all_or_nothing(mut self) -> Self {
        self.all_or_nothing = true;
        self
    }

    #[must_use]
    pub fn into_allocation(mut self, id: AllocationId) -> Self {
        self.allocation = Some(id);
        self
    }
}

/// Requests the launch service serves.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchRequest {
    Launch(LaunchArgs),
}

impl Protocol for LaunchRequest {
    const SERVICE: &'static str = "launch service";

    fn message_type(&self) -> MessageType {
        match self {
            LaunchRequest::Launch(_) => MessageType::Launch,
        }
    }

    fn to_payload(&self) -> ProtoResult<Value> {
        match self {
            LaunchRequest::Launch(args) => Ok(serde_json::to_value(args)?),
        }
    }

    fn from_parts(message_type: MessageType, value: Value) -> ProtoResult<Self> {
        match message_type {
            MessageType::Launch => Ok(LaunchRequest::Launch(payload(value)?)),
            MessageType::Allocate
            | MessageType::CommitPlan
            | MessageType::ReleaseChunks
            | MessageType::ReleaseAll
            | MessageType::ReleaseWorker
            | MessageType::Transfer
            | MessageType::RegisterExitRelease
            | MessageType::Snapshot
            | MessageType::Capacity
            | MessageType::FreeRam
            | MessageType::PhaseStarted
            | MessageType::PhaseDone
            | MessageType::Reply => Err(Self::unexpected(message_type)),
        }
    }
}

/// One worker's share of a launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub hostname: String,
    pub threads: u64,
    /// `None` when the process never started; its RAM was released.
    pub pid: Option<Pid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchResult {
    /// The allocation as it stands after failed workers were released.
    pub allocation: Allocation,
    /// In allocation chunk order.
    pub placements: Vec<Placement>,
}

impl LaunchResult {
    /// One entry per placement; gaps are placements that failed to start.
    pub fn pids(&self) -> Vec<Option<Pid>> {
        self.placements.iter().map(|p| p.pid).collect()
    }

    pub fn started_pids(&self) -> Vec<Pid> {
        self.placements.iter().filter_map(|p| p.pid).collect()
    }

    pub fn started_threads(&self) -> u64 {
        self.placements
            .iter()
            .filter(|p| p.pid.is_some())
            .map(|p| p.threads)
            .sum()
    }

    pub fn has_gaps(&self) -> bool {
        self.placements.iter().any(|p| p.pid.is_none())
    }
}
