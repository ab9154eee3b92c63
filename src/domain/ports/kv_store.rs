//! Key/Value Store Port
//!
//! Defines the interface for durable string persistence shared by the
//! cache, the action queue and the conflict engine.

use crate::domain::entities::StorageChange;
use crate::error::StorageError;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Namespaced string key/value persistence.
///
/// This is an outbound port. Implementations may use SQLite, an
/// in-memory map or any other medium. Writes are last-writer-wins.
/// Every successful mutation is published on the change channel so that
/// other instances sharing the same medium can reload.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value, replacing any previous one.
    ///
    /// Fails with `QuotaExceeded` when the write would exceed the byte quota.
    async fn set(&self, namespace: &str, key: &str, value: String) -> Result<(), StorageError>;

    /// Remove a value. Removing a missing key is not an error.
    async fn remove(&self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// Remove a value only if it still equals `expected`. Returns whether it was removed.
    ///
    /// The comparison and the removal are atomic with respect to `set`.
    async fn remove_if(&self, namespace: &str, key: &str, expected: &str) -> Result<bool, StorageError>;

    /// List the keys of a namespace in ascending order.
    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StorageError>;

    /// List every (key, value) pair of a namespace in ascending key order.
    async fn entries(&self, namespace: &str) -> Result<Vec<(String, String)>, StorageError>;

    /// Remove every value of a namespace.
    async fn clear(&self, namespace: &str) -> Result<(), StorageError>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}
