//! Error types for Gridstream
//!
//! Both pipelines surface exactly one terminal outcome per operation: success,
//! [`GridError::Cancelled`], or one of the typed failures below. Rows already
//! handed to a consumer are never rolled back.

use thiserror::Error;

/// Result type alias for Gridstream operations
pub type Result<T> = std::result::Result<T, GridError>;

/// Main error type for Gridstream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    /// User- or system-initiated abort. Not a failure and never logged as one.
    #[error("Operation cancelled")]
    Cancelled,

    /// Decode or structural anomaly in the input.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The underlying read or fetch failed. Fatal to the current operation only.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Internal invariant violation, e.g. a stored chunk that is not resident
    /// when its waiters are served.
    #[error("Cache inconsistency: {0}")]
    CacheInconsistency(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GridError {
    /// Create a malformed input error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInput(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a cache inconsistency error
    pub fn inconsistency(msg: impl Into<String>) -> Self {
        Self::CacheInconsistency(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for the cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True when the error ends the current operation.
    ///
    /// Malformed input is tolerated by the parser and reported in its summary,
    /// so it only becomes fatal when a caller chooses to surface it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::MalformedInput(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(GridError::Cancelled.is_cancelled());
        assert!(!GridError::Cancelled.is_fatal());
        assert!(!GridError::malformed("bad quote").is_fatal());
        assert!(GridError::transport("connection reset").is_fatal());
        assert!(GridError::inconsistency("missing chunk").is_fatal());
    }

    #[test]
    fn test_clone_keeps_message() {
        let err = GridError::transport("connection reset");
        assert_eq!(err.clone(), err);
    }

    #[test]
    fn test_display() {
        assert_eq!(GridError::Cancelled.to_string(), "Operation cancelled");
        assert_eq!(
            GridError::transport("status 500").to_string(),
            "Transport failure: status 500"
        );
    }
}
