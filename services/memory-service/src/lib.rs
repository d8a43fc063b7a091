//! Memory service.
//!
//! Owns the worker registry and allocation ledger for the whole fleet and
//! serves them over the memory port:
//! - Allocation requests are planned and committed with conflict checks
//! - Releases, transfers, and exit registrations go through the same queue
//! - Workers are discovered and refreshed from the host on a timer
//! - Allocations registered against a process are released when it exits

pub mod config;
pub mod error;
pub mod service;

pub use config::MemoryConfig;
pub use error::MemoryServiceError;
pub use service::{MemoryService, RefreshStats};
