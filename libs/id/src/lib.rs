//! # fleet-id
//!
//! Typed identifiers shared by the memory service, launcher, and batcher.
//!
//! ## Kinds of IDs
//!
//! - **Counters** (`AllocationId`, `Pid`, `PortId`): small integers issued by
//!   a single owner. Allocation ids are monotonic and never reused, which lets
//!   the ledger tell "already released" apart from "never existed".
//! - **Prefixed ULIDs** (`BatchId`, `RequestId`): generated anywhere, sortable
//!   by creation time, formatted as `{prefix}_{ulid}`.
//!
//! Examples:
//! - `batch_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `req_01HV4Z3MXNKPQR9HSTZ7WCLD4E`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
