//! Batch scheduler errors.

use fleet_host::HostError;
use fleet_proto::ProtoError;
use fleet_transport::TransportError;
use thiserror::Error;

use crate::batch::BatchState;

/// Errors that prevent a batch from being planned or run.
///
/// Launch failures and missed deadlines are not errors: they end the batch
/// in [`BatchState::PartialFailure`] or [`BatchState::TimedOut`].
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("batch cannot move from {from} to {to}")]
    InvalidTransition { from: BatchState, to: BatchState },

    #[error("host error: {0}")]
    Host(#[from] HostError),

    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl BatchError {
    pub fn invalid(message: impl Into<String>) -> Self {
        BatchError::InvalidArgument(message.into())
    }
}
