//! Transport errors.

use std::time::Duration;

use fleet_id::PortId;
use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised while moving frames between ports.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Nobody reads this port (never opened, or its reader went away).
    #[error("port {0} is closed")]
    Closed(PortId),

    /// The port queue is at capacity.
    #[error("port {0} is full")]
    Full(PortId),

    /// The port already has a reader.
    #[error("port {0} is already open")]
    PortInUse(PortId),

    /// No frame arrived in time.
    #[error("no reply on port {port} within {after:?}")]
    Timeout { port: PortId, after: Duration },

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed(_))
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}
