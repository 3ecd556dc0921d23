//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs and names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

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

    /// A user-chosen resource name is longer than allowed.
    #[error("invalid {kind} [{name}]: must be at most {max} characters")]
    NameTooLong {
        kind: &'static str,
        name: String,
        max: usize,
    },

    /// A user-chosen resource name breaks the naming rules.
    #[error("invalid {kind} [{name}]: must contain lowercase alphanumeric (a-z and 0-9), hyphens or underscores; must start and end with alphanumeric")]
    InvalidName { kind: &'static str, name: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error came from resource name validation.
    pub fn is_name_error(&self) -> bool {
        matches!(self, IdError::NameTooLong { .. } | IdError::InvalidName { .. })
    }
}
