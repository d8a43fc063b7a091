//! Error handling and display for the CLI.

use colored::Colorize;
use fleet_proto::{ProtoError, ServiceError};
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not enough free RAM: requested {requested} chunks, {satisfiable} satisfiable")]
    InsufficientCapacity { requested: u64, satisfiable: u64 },

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

impl From<ProtoError> for CliError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Service(ServiceError::InsufficientCapacity {
                requested,
                satisfiable,
            }) => Self::InsufficientCapacity {
                requested,
                satisfiable,
            },
            ProtoError::Service(e) => Self::Service(e),
            other => Self::Other(other.into()),
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    let Some(cli_err) = err.downcast_ref::<CliError>() else {
        return;
    };
    match cli_err {
        CliError::InvalidArgument(_) => {
            eprintln!("\n{}", "Hint: Run `fleetctl --help` for usage.".yellow());
        }
        CliError::InsufficientCapacity { satisfiable: 0, .. } => {
            eprintln!(
                "\n{}",
                "Hint: No worker has room for one chunk. Check `fleetctl capacity`.".yellow()
            );
        }
        CliError::InsufficientCapacity { satisfiable, .. } => {
            eprintln!(
                "\n{}",
                format!("Hint: Retry with at most {satisfiable} threads.").yellow()
            );
        }
        CliError::Service(ServiceError::InvalidArgument { .. }) => {
            eprintln!(
                "\n{}",
                "Hint: Check the script and host names against the world file.".yellow()
            );
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_errors_keep_counts() {
        let err: CliError = ProtoError::Service(ServiceError::InsufficientCapacity {
            requested: 12,
            satisfiable: 7,
        })
        .into();
        assert!(matches!(
            err,
            CliError::InsufficientCapacity {
                requested: 12,
                satisfiable: 7
            }
        ));
    }

    #[test]
    fn test_other_service_errors_pass_through() {
        let err: CliError = ProtoError::Service(ServiceError::invalid("unknown script")).into();
        assert_eq!(err.to_string(), "Service error: invalid argument: unknown script");

        let err: CliError = ProtoError::Payload("bad".to_string()).into();
        assert_eq!(err.to_string(), "invalid payload: bad");
    }
}
