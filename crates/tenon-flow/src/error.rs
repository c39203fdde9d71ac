//! Error taxonomy for the reconciliation engine.
//!
//! Each kind maps to a documented recovery behavior: `Validation` is
//! rejected and never retried, `Transient` is retried with backoff,
//! `Resolution` is retried until the run's deadline, `Execution`,
//! `Timeout`, and `Cancelled` are terminal run outcomes, and `Internal`
//! is logged and re-queued with backoff while the condition stays
//! `Unknown`.

use tenon_api::validate::FieldErrorList;

/// The result type used throughout tenon-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The object failed validation; non-retryable.
    #[error("validation failed: {errors}")]
    Validation {
        /// Aggregated field errors.
        errors: FieldErrorList,
    },

    /// A substrate call failed; retried with backoff.
    #[error("transient substrate error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A status write lost an optimistic-concurrency race; re-read and retry.
    #[error("resource version conflict: expected {expected}, found {actual}")]
    Conflict {
        /// The version the write carried.
        expected: u64,
        /// The version the substrate holds.
        actual: u64,
    },

    /// Remote spec resolution failed; retried until the run deadline.
    #[error("resolution failed: {message}")]
    Resolution {
        /// Description of the failure.
        message: String,
    },

    /// A step or sidecar failed; terminal.
    #[error("execution failed: {message}")]
    Execution {
        /// Description of the failure.
        message: String,
    },

    /// A referenced object does not exist.
    #[error("{kind} \"{name}\" not found")]
    NotFound {
        /// Kind of the missing object.
        kind: &'static str,
        /// Name of the missing object.
        name: String,
    },

    /// A bug; logged and re-queued with backoff.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },

    /// An error from the kernel.
    #[error("core error: {0}")]
    Core(#[from] tenon_core::Error),
}

impl Error {
    /// Creates a transient error from a message.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a transient error with a source cause.
    #[must_use]
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true when the queue should retry the pass with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Conflict { .. } | Self::Resolution { .. } | Self::Internal { .. }
        )
    }
}

impl From<FieldErrorList> for Error {
    fn from(errors: FieldErrorList) -> Self {
        Self::Validation { errors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_kind() {
        assert!(Error::transient("api down").is_retryable());
        assert!(Error::Conflict { expected: 1, actual: 2 }.is_retryable());
        assert!(Error::internal("bug").is_retryable());
        assert!(!Error::Execution {
            message: "step exited 1".into()
        }
        .is_retryable());
        assert!(!Error::NotFound {
            kind: "Task",
            name: "build".into()
        }
        .is_retryable());
    }
}
