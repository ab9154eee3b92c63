//! Error Taxonomy
//!
//! Errors surfaced by the storage, remote and conflict layers.
//! Malformed persisted data is deliberately absent: it is logged and
//! treated as empty state, never returned to a caller.

use crate::domain::entities::ActionKind;
use std::time::Duration;

/// Persistence failure in a key/value store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The write would push the store past its byte quota
    #[error("storage quota exceeded: needed {needed} bytes, quota is {quota} bytes")]
    QuotaExceeded { needed: usize, quota: usize },
    /// The value could not be serialized or deserialized
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The backing store itself failed
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// Failure reported by the remote collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Transport-level failure (unreachable, connection reset)
    #[error("network error: {0}")]
    Network(String),
    /// The call did not complete within the configured timeout
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    /// The remote refused the mutation (validation, permissions)
    #[error("remote rejected the request: {0}")]
    Rejected(String),
    /// The targeted record does not exist remotely
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Failure while resolving a conflict.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictError {
    #[error("conflict not found: {0}")]
    NotFound(String),
    #[error("conflict already resolved: {0}")]
    AlreadyResolved(String),
    /// A newer detection on the same record replaced this conflict
    #[error("conflict {id} was superseded by {by}")]
    Superseded { id: String, by: String },
    /// Another resolution of the same conflict is committing
    #[error("conflict resolution already in progress: {0}")]
    InProgress(String),
    /// Writing the chosen record to the remote failed; the conflict stays pending
    #[error("failed to commit resolution: {0}")]
    CommitFailed(#[from] RemoteError),
    /// The strategy could not produce a record for this conflict
    #[error("conflict cannot be resolved: {0}")]
    Unresolvable(String),
}

/// Rejected enqueue request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("action target collection is empty")]
    MissingTarget,
    #[error("{0} action requires a payload")]
    MissingPayload(ActionKind),
    #[error("{0} action requires a selector")]
    MissingSelector(ActionKind),
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("batch_size must be greater than zero")]
    ZeroBatchSize,
    #[error("max_attempts must be greater than zero")]
    ZeroMaxAttempts,
    #[error("max_delay must not be lower than base_delay")]
    InvalidBackoff,
    #[error("collection name is required")]
    MissingCollection,
    #[error("unknown resolution strategy: {0}")]
    UnknownStrategy(String),
    #[error("{0} must be greater than zero")]
    InvalidInterval(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_exceeded_display() {
        let err = StorageError::QuotaExceeded {
            needed: 2048,
            quota: 1024,
        };
        assert_eq!(
            err.to_string(),
            "storage quota exceeded: needed 2048 bytes, quota is 1024 bytes"
        );
    }

    #[test]
    fn test_serde_error_maps_to_serialization() {
        let err: StorageError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, StorageError::Serialization(_)));
    }

    #[test]
    fn test_commit_failed_from_remote_error() {
        let err: ConflictError = RemoteError::Network("offline".to_string()).into();
        assert_eq!(
            err.to_string(),
            "failed to commit resolution: network error: offline"
        );
    }

    #[test]
    fn test_timeout_display() {
        let err = RemoteError::Timeout(Duration::from_millis(500));
        assert_eq!(err.to_string(), "remote call timed out after 500ms");
    }
}
