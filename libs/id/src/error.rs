//! Id parse errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("empty id")]
    Empty,

    /// Wrong prefix, missing separator, or a bad ULID body.
    #[error("malformed {kind} id: {input:?}")]
    Malformed { kind: &'static str, input: String },

    #[error("not a number: {0:?}")]
    InvalidNumber(String),
}

impl IdError {
    pub fn malformed(kind: &'static str, input: &str) -> Self {
        IdError::Malformed {
            kind,
            input: input.to_string(),
        }
    }
}
