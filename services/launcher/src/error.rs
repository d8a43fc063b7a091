//! Launch service errors.

use fleet_host::HostError;
use fleet_proto::{ProtoError, ServiceError};
use fleet_transport::TransportError;
use thiserror::Error;

/// Errors from launching a script.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No process could be kept running; everything was released.
    #[error("launch of {script} failed: {reason}")]
    Failed { script: String, reason: String },

    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// The memory service refused or could not be reached.
    #[error("memory service: {0}")]
    Memory(#[from] ProtoError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl LaunchError {
    pub fn invalid(message: impl Into<String>) -> Self {
        LaunchError::InvalidArgument(message.into())
    }
}

impl From<LaunchError> for ServiceError {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::InvalidArgument(message) => ServiceError::InvalidArgument { message },
            LaunchError::Host(
                e @ (HostError::UnknownScript(_)
                | HostError::UnknownServer(_)
                | HostError::InvalidArgument(_)),
            ) => ServiceError::invalid(e.to_string()),
            LaunchError::Memory(e) => ServiceError::from(e),
            other => ServiceError::launch_failure(other.to_string()),
        }
    }
}
