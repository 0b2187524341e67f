//! Error taxonomy shared by the queue, transfer and sync layers.
//!
//! Every failure carries an [`ErrorClass`] so callers decide between
//! retrying, skipping and surfacing without looking at message text.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a failure should be treated by the component that observes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input; never retried
    Validation,

    /// Timeout, connection reset, busy engine; retried with backoff
    Transient,

    /// Missing or corrupt resource; terminal
    Permanent,

    /// No connectivity; an expected, silent outcome
    NetworkUnavailable,

    /// Credentials missing or rejected; caller must resupply them
    Unauthenticated,

    /// Local and remote state diverged; handled by the conflict resolver
    Conflict,
}

impl ErrorClass {
    /// Whether the failing operation may be attempted again automatically
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::NetworkUnavailable)
    }
}

/// Errors raised by a [`crate::store::LocalStore`] backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store is locked: {0}")]
    Lock(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {from} → {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("Crash recovery must run before the queue hands out work")]
    RecoveryPending,

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Permanent resource error: {0}")]
    PermanentResource(String),

    #[error("Network unavailable")]
    NetworkUnavailable,

    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Conflict on {entity_type}/{entity_id}")]
    Conflict {
        entity_type: String,
        entity_id: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_)
            | Self::NotFound(_)
            | Self::InvalidTransition { .. }
            | Self::RecoveryPending => ErrorClass::Validation,
            Self::TransientIo(_) | Self::Store(_) => ErrorClass::Transient,
            Self::PermanentResource(_) => ErrorClass::Permanent,
            Self::NetworkUnavailable => ErrorClass::NetworkUnavailable,
            Self::Unauthenticated => ErrorClass::Unauthenticated,
            Self::Conflict { .. } => ErrorClass::Conflict,
        }
    }

    /// Whether this error may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Classify an I/O error raised while touching `what`.
    ///
    /// Missing, unreadable or truncated resources are permanent; everything
    /// else (timeouts, resets, interrupted calls) is transient.
    pub fn from_io(err: &io::Error, what: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::InvalidData
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::UnexpectedEof => {
                Self::PermanentResource(format!("{}: {}", what, err))
            }
            _ => Self::TransientIo(format!("{}: {}", what, err)),
        }
    }

    /// Classify a non-success HTTP status returned while doing `what`
    pub fn from_status(status: u16, what: &str) -> Self {
        match status {
            401 | 403 => Self::Unauthenticated,
            408 | 429 | 500..=599 => Self::TransientIo(format!("{}: HTTP {}", what, status)),
            _ => Self::PermanentResource(format!("{}: HTTP {}", what, status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(
            SyncError::from_io(&missing, "source").class(),
            ErrorClass::Permanent
        );

        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(
            SyncError::from_io(&timeout, "source").class(),
            ErrorClass::Transient
        );

        let truncated = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        assert!(!SyncError::from_io(&truncated, "chunk").is_retryable());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(SyncError::from_status(401, "push").class(), ErrorClass::Unauthenticated);
        assert_eq!(SyncError::from_status(403, "push").class(), ErrorClass::Unauthenticated);
        assert_eq!(SyncError::from_status(429, "chunk").class(), ErrorClass::Transient);
        assert_eq!(SyncError::from_status(503, "chunk").class(), ErrorClass::Transient);
        assert_eq!(SyncError::from_status(404, "chunk").class(), ErrorClass::Permanent);
        assert_eq!(SyncError::from_status(413, "chunk").class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_store_errors_are_transient() {
        let err = SyncError::from(StoreError::Lock("held".to_string()));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_expected_outcomes_are_classified() {
        assert_eq!(
            SyncError::NetworkUnavailable.class(),
            ErrorClass::NetworkUnavailable
        );
        assert_eq!(SyncError::Unauthenticated.class(), ErrorClass::Unauthenticated);
        assert!(!SyncError::Unauthenticated.is_retryable());
        assert!(!SyncError::Validation("bad".into()).is_retryable());
    }
}
