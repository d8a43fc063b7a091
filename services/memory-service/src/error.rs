//! Memory service errors.

use fleet_host::HostError;
use fleet_memory::MemoryError;
use fleet_transport::TransportError;
use thiserror::Error;

/// Errors that stop the memory service or one of its maintenance passes.
#[derive(Debug, Error)]
pub enum MemoryServiceError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("host error: {0}")]
    Host(#[from] HostError),

    #[error("allocator error: {0}")]
    Memory(#[from] MemoryError),
}
