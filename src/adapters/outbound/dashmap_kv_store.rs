//! DashMap Key/Value Store
//!
//! Implements KeyValueStore in memory using DashMap for lock-free
//! concurrent access. Nothing survives the process.

use crate::domain::entities::StorageChange;
use crate::domain::ports::KeyValueStore;
use crate::error::StorageError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// In-memory key/value store.
///
/// Clones share the same map and change channel, which makes two clones
/// behave like two instances over the same persistent medium.
#[derive(Clone)]
pub struct DashMapKeyValueStore {
    entries: Arc<DashMap<(String, String), String>>,
    quota: Option<usize>,
    changes: broadcast::Sender<StorageChange>,
}

impl DashMapKeyValueStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            entries: Arc::new(DashMap::new()),
            quota: None,
            changes,
        }
    }

    /// Limit the total stored bytes (keys plus values).
    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Total stored bytes across every namespace.
    pub fn usage(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.key().1.len() + e.value().len())
            .sum()
    }

    fn publish(&self, namespace: &str, key: Option<&str>) {
        let _ = self.changes.send(StorageChange {
            namespace: namespace.to_string(),
            key: key.map(str::to_string),
        });
    }
}

impl Default for DashMapKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for DashMapKeyValueStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .entries
            .get(&(namespace.to_string(), key.to_string()))
            .map(|v| v.value().clone()))
    }

    async fn set(&self, namespace: &str, key: &str, value: String) -> Result<(), StorageError> {
        let id = (namespace.to_string(), key.to_string());

        if let Some(quota) = self.quota {
            let existing = self
                .entries
                .get(&id)
                .map(|v| key.len() + v.value().len())
                .unwrap_or(0);
            let needed = self.usage() - existing + key.len() + value.len();
            if needed > quota {
                return Err(StorageError::QuotaExceeded { needed, quota });
            }
        }

        self.entries.insert(id, value);
        self.publish(namespace, Some(key));
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        if self
            .entries
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some()
        {
            self.publish(namespace, Some(key));
        }
        Ok(())
    }

    async fn remove_if(&self, namespace: &str, key: &str, expected: &str) -> Result<bool, StorageError> {
        let removed = self
            .entries
            .remove_if(&(namespace.to_string(), key.to_string()), |_, v| v == expected)
            .is_some();
        if removed {
            self.publish(namespace, Some(key));
        }
        Ok(removed)
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.key().1.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn entries(&self, namespace: &str) -> Result<Vec<(String, String)>, StorageError> {
        let mut entries: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        entries.sort();
        Ok(entries)
    }

    async fn clear(&self, namespace: &str) -> Result<(), StorageError> {
        self.entries.retain(|(ns, _), _| ns != namespace);
        self.publish(namespace, None);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}
