//! # fleet-proto
//!
//! The message layer between scripts and services.
//!
//! Each endpoint has one closed request enum implementing [`Protocol`]:
//!
//! | Endpoint | Enum | Tags |
//! |---|---|---|
//! | memory service | [`MemoryRequest`] | 1..=10 |
//! | launch service | [`LaunchRequest`] | 20 |
//! | batch done port | [`BatchSignal`] | 30, 31 |
//!
//! Replies use tag 99 and carry `Result<Response, ServiceError>`.
//!
//! [`ServiceClient`] implements the request/response exchange once over any
//! [`Transport`](fleet_transport::Transport); [`MemoryClient`] and
//! [`LaunchClient`] are thin typed wrappers.

mod batch;
mod client;
mod error;
mod launch;
mod memory;
mod message;

pub use batch::{BatchSignal, PhaseKind, PhaseSignal};
pub use client::{
    AllocationGuard, LaunchClient, MemoryClient, ServiceClient, DEFAULT_CONFLICT_RETRIES,
    DEFAULT_LAUNCH_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};
pub use error::{ProtoError, ProtoResult, ServiceError};
pub use launch::{LaunchArgs, LaunchRequest, LaunchResult, Placement};
pub use memory::{
    AllocateArgs, CommitPlanArgs, ExitReleaseArgs, MemoryRequest, MemoryResponse,
    ReleaseChunksArgs, ReleaseWorkerArgs, TransferArgs,
};
pub use message::{decode_reply, reply_message, MessageType, Protocol};
