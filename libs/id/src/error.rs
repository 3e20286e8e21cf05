//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID is longer than allowed.
    #[error("ID too long: {len} bytes exceeds limit of {max}")]
    TooLong { len: usize, max: usize },

    /// The ID contains a character outside the allowed set.
    #[error("invalid character {ch:?} at offset {offset}")]
    InvalidChar { ch: char, offset: usize },

    /// The ID is a reserved name (`.` or `..`).
    #[error("ID '{0}' is reserved")]
    Reserved(String),

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
