//! Error types for id parsing.

use thiserror::Error;

/// Errors that can occur when parsing an id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The id string is empty.
    #[error("id cannot be empty")]
    Empty,

    /// The id carries another resource's prefix.
    #[error("invalid id prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The id has no `_` between prefix and ULID.
    #[error("id missing underscore separator")]
    MissingSeparator,

    /// The ULID portion could not be decoded.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if the id was for a different resource type.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
