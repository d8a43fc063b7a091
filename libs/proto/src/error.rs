//! Protocol and service errors.

use fleet_id::AllocationId;
use fleet_memory::{MemoryError, Ram};
use fleet_transport::TransportError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::MessageType;

/// Result type for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Errors raised while encoding, decoding, or exchanging messages.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtoError {
    /// The tag is not a known message type.
    #[error("unknown message type tag {0}")]
    UnknownType(u16),

    /// A known message type sent to a service that does not handle it.
    #[error("{service} does not handle {actual} messages")]
    UnexpectedType {
        service: &'static str,
        actual: MessageType,
    },

    /// The payload does not match the message type.
    #[error("invalid payload: {0}")]
    Payload(String),

    /// The reply was well-formed but not the kind the request expects.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Moving the frame failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The service answered with an error.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl ProtoError {
    /// The service-side error, if that is what this is.
    pub fn as_service(&self) -> Option<&ServiceError> {
        match self {
            ProtoError::Service(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtoError::Transport(e) if e.is_timeout())
            || matches!(self, ProtoError::Service(ServiceError::Timeout { .. }))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ProtoError::Service(e) if e.is_conflict())
    }
}

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        ProtoError::Payload(err.to_string())
    }
}

/// Error a service sends back across a port.
///
/// Mirrors the failure taxonomy every caller handles: bad arguments, no
/// capacity, optimistic-concurrency conflicts, unknown ids, launch failures,
/// and timeouts.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceError {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("insufficient capacity: requested {requested} chunks, {satisfiable} satisfiable")]
    InsufficientCapacity { requested: u64, satisfiable: u64 },

    #[error("allocation conflict on {hostname}: plan needs {required}, {available} free")]
    AllocationConflict {
        hostname: String,
        required: Ram,
        available: Ram,
    },

    #[error("unknown allocation: {id}")]
    UnknownAllocation { id: AllocationId },

    #[error("unknown worker: {hostname}")]
    UnknownWorker { hostname: String },

    #[error("worker already registered: {hostname}")]
    DuplicateWorker { hostname: String },

    /// Processes failed to start even though RAM was reserved for them.
    #[error("launch failure: {message}")]
    LaunchFailure { message: String },

    #[error("timed out: {message}")]
    Timeout { message: String },
}

impl ServiceError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ServiceError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn launch_failure(message: impl Into<String>) -> Self {
        ServiceError::LaunchFailure {
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ServiceError::AllocationConflict { .. })
    }

    pub fn satisfiable(&self) -> Option<u64> {
        match self {
            ServiceError::InsufficientCapacity { satisfiable, .. } => Some(*satisfiable),
            _ => None,
        }
    }
}

impl From<MemoryError> for ServiceError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::DuplicateWorker(hostname) => ServiceError::DuplicateWorker { hostname },
            MemoryError::UnknownWorker(hostname) => ServiceError::UnknownWorker { hostname },
            MemoryError::InvalidArgument(message) => ServiceError::InvalidArgument { message },
            MemoryError::InsufficientCapacity {
                requested,
                satisfiable,
            } => ServiceError::InsufficientCapacity {
                requested,
                satisfiable,
            },
            MemoryError::AllocationConflict {
                hostname,
                required,
                available,
            } => ServiceError::AllocationConflict {
                hostname,
                required,
                available,
            },
            MemoryError::UnknownAllocation(id) => ServiceError::UnknownAllocation { id },
        }
    }
}

impl From<ProtoError> for ServiceError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Service(e) => e,
            ProtoError::Transport(e) if e.is_timeout() => ServiceError::Timeout {
                message: e.to_string(),
            },
            other => ServiceError::InvalidArgument {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_errors_map_one_to_one() {
        let err: ServiceError = MemoryError::InsufficientCapacity {
            requested: 8,
            satisfiable: 3,
        }
        .into();
        assert_eq!(err.satisfiable(), Some(3));

        let err: ServiceError = MemoryError::UnknownAllocation(AllocationId::new(4)).into();
        assert_eq!(
            err,
            ServiceError::UnknownAllocation {
                id: AllocationId::new(4)
            }
        );
    }

    #[test]
    fn test_service_error_wire_form() {
        let json = serde_json::to_value(ServiceError::AllocationConflict {
            hostname: "n00dles".into(),
            required: Ram::from_gb(4),
            available: Ram::from_gb(2),
        })
        .unwrap();
        assert_eq!(json["kind"], "allocation_conflict");
        assert_eq!(json["required"], 4096);
        let back: ServiceError = serde_json::from_value(json).unwrap();
        assert!(back.is_conflict());
    }
}
