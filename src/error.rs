//! Typed failure taxonomy for the memory core.
//!
//! Every public operation returns [`Result`]. Storage-layer errors from
//! `rusqlite` are translated here before they reach callers, so nothing above
//! the store ever sees a raw SQLite error.

use thiserror::Error;

/// The error type returned by all store, search, and compaction operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Malformed input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Underlying I/O or database failure.
    #[error("storage error: {message}")]
    Storage {
        message: String,
        /// `true` for transient conditions (busy/locked database).
        retryable: bool,
    },

    /// The embedding provider failed, timed out, or is not configured.
    #[error("embedding unavailable ({provider}): {reason}")]
    EmbeddingUnavailable { provider: String, reason: String },

    /// A referenced block, task, or session does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

pub type Result<T> = std::result::Result<T, MemoryError>;

impl MemoryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn embedding(provider: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::EmbeddingUnavailable {
            provider: provider.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { retryable: true, .. })
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        let retryable = matches!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        );
        Self::Storage {
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage {
            message: format!("metadata encoding: {err}"),
            retryable: false,
        }
    }
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Storage {
            message: format!("blocking task failed: {err}"),
            retryable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_sqlite_errors_are_retryable() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let mapped: MemoryError = err.into();
        assert!(mapped.is_retryable());
    }

    #[test]
    fn constraint_errors_are_not_retryable() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        let mapped: MemoryError = err.into();
        assert!(!mapped.is_retryable());
        assert!(matches!(mapped, MemoryError::Storage { .. }));
    }

    #[test]
    fn not_found_message_names_kind() {
        let err = MemoryError::not_found("block", "abc");
        assert_eq!(err.to_string(), "block not found: abc");
    }
}
