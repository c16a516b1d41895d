//! Error types for charon-core

use thiserror::Error;

/// Result type alias for charon-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Control-plane error kinds
///
/// Every fallible path in the control plane surfaces one of these kinds.
/// The HTTP layer maps kinds to status codes; the reconciler logs them and
/// moves on to the next item.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or incomplete input
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Missing or unverifiable credentials
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Authenticated but not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request conflicts with current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Candidate has no budget left for the requested instance
    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    /// No (instance type, region) pair currently has capacity
    #[error("Capacity unavailable: {0}")]
    CapacityUnavailable(String),

    /// Upstream call failed but is worth retrying
    #[error("Upstream transient error: {0}")]
    UpstreamTransient(String),

    /// Upstream rejected the request outright
    #[error("Upstream permanent error: {0}")]
    UpstreamPermanent(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an unauthenticated error
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a quota-exhausted error
    pub fn quota_exhausted(msg: impl Into<String>) -> Self {
        Self::QuotaExhausted(msg.into())
    }

    /// Create a capacity-unavailable error
    pub fn capacity_unavailable(msg: impl Into<String>) -> Self {
        Self::CapacityUnavailable(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same operation later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTransient(_) | Self::CapacityUnavailable(_) | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::validation("instanceTypes must not be empty");
        assert!(err.to_string().contains("Validation"));

        let err = Error::quota_exhausted("remaining 12 cents");
        assert!(err.to_string().contains("Quota"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::UpstreamTransient("timeout".into()).is_transient());
        assert!(!Error::UpstreamPermanent("unknown type".into()).is_transient());
        assert!(!Error::conflict("active vm").is_transient());
    }
}
