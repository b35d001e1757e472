//! Error taxonomy for the map pipeline.
//!
//! Every fallible operation in the engine returns [`MapError`]. The variants
//! drive control flow in the facade: cancellation and deadlines propagate
//! immediately, backend errors fall back to cached results, configuration
//! errors surface as-is.

use thiserror::Error;

/// Engine-level error.
#[derive(Debug, Error)]
pub enum MapError {
    /// The caller's context or the service itself was canceled.
    #[error("operation canceled")]
    Canceled,

    /// A deadline attached to the caller's context expired mid-pipeline.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A structural precondition is unmet (e.g. parity mode without a bound
    /// token counter). Never retried, never latched.
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage or I/O failure. `action` names the operation that failed
    /// ("begin tag transaction", "list repo-map tags", ...).
    #[error("{action}: {message}")]
    Backend {
        action: &'static str,
        message: String,
    },
}

impl MapError {
    pub fn backend(action: &'static str, err: impl std::fmt::Display) -> Self {
        MapError::Backend { action, message: err.to_string() }
    }

    /// True for `Canceled` and `DeadlineExceeded`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, MapError::Canceled | MapError::DeadlineExceeded)
    }

    pub fn is_deadline(&self) -> bool {
        matches!(self, MapError::DeadlineExceeded)
    }
}

/// Error type for the pluggable storage layer. Implementations report plain
/// messages; the engine wraps them into [`MapError::Backend`] with the name
/// of the action it was attempting.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(msg: impl Into<String>) -> Self {
        StoreError(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_names_the_action() {
        let err = MapError::backend("list repo-map tags", "disk on fire");
        assert_eq!(err.to_string(), "list repo-map tags: disk on fire");
    }

    #[test]
    fn cancellation_classification() {
        assert!(MapError::Canceled.is_cancellation());
        assert!(MapError::DeadlineExceeded.is_cancellation());
        assert!(MapError::DeadlineExceeded.is_deadline());
        assert!(!MapError::Canceled.is_deadline());
        assert!(!MapError::Config("x".into()).is_cancellation());
    }
}
