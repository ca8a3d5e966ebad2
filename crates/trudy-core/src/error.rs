//! Error types for the Trudy domain.

use crate::ids::IdError;

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;

/// Errors raised by domain type parsing and validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// A stored or received string does not name a known variant.
    #[error("unknown {kind}: {value}")]
    UnknownVariant {
        /// The enum being parsed (e.g. "call status").
        kind: &'static str,
        /// The rejected input.
        value: String,
    },

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// A credit amount that must be positive was not.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// A reported call duration outside the accepted range.
    #[error("invalid call duration: {0}")]
    InvalidDuration(String),
}
