//! Error types and result aliases shared across Tenon crates.
//!
//! Errors are structured for programmatic handling and include context for
//! debugging. Crate-local error enums in `tenon-api` and `tenon-flow` wrap
//! or convert these where richer context exists.

/// The result type used throughout the Tenon kernel.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in kernel operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An object name failed DNS-label validation.
    #[error("invalid name: {message}")]
    InvalidName {
        /// Description of what made the name invalid.
        message: String,
    },

    /// A duration string or value was invalid.
    #[error("invalid duration: {message}")]
    InvalidDuration {
        /// Description of the invalid duration.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A condition transition out of a terminal state was attempted.
    #[error("condition is terminal: cannot move from {from} to {to}")]
    TerminalCondition {
        /// The terminal reason currently recorded.
        from: String,
        /// The rejected target reason.
        to: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new invalid-name error.
    #[must_use]
    pub fn invalid_name(message: impl Into<String>) -> Self {
        Self::InvalidName {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
