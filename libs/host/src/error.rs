//! Host errors.

use fleet_id::Pid;
use fleet_memory::Ram;
use thiserror::Error;

/// Result type for host calls.
pub type HostResult<T> = Result<T, HostError>;

/// Errors returned by the host capability surface.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HostError {
    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("unknown script: {0}")]
    UnknownScript(String),

    #[error("no root access on {0}")]
    NotRooted(String),

    #[error("unknown process: {0}")]
    UnknownProcess(Pid),

    #[error("{hostname} has {available} free, {script} needs {required}")]
    InsufficientRam {
        hostname: String,
        script: String,
        required: Ram,
        available: Ram,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The host refused to start the process.
    #[error("failed to start {script} on {hostname}: {reason}")]
    ExecFailed {
        script: String,
        hostname: String,
        reason: String,
    },

    /// A world file could not be read or parsed.
    #[error("world error: {0}")]
    World(String),
}

impl HostError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HostError::ExecFailed { .. } | HostError::InsufficientRam { .. }
        )
    }
}

impl From<toml::de::Error> for HostError {
    fn from(err: toml::de::Error) -> Self {
        HostError::World(err.to_string())
    }
}
