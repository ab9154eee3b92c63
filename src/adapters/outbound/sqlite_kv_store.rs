//! SQLite Key/Value Store
//!
//! Implements KeyValueStore on a single SQLite table. Used for durable
//! persistence of the cache, the action queue and the conflict log.

use crate::domain::entities::StorageChange;
use crate::domain::ports::KeyValueStore;
use crate::error::StorageError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::sync::broadcast;

/// Current schema version.
const SCHEMA_VERSION: i32 = 1;

/// SQLite-backed key/value store.
///
/// A single connection guarded by a mutex; every statement is short and
/// the lock is never held across an await point.
pub struct SqliteKeyValueStore {
    conn: Mutex<Connection>,
    quota: Option<usize>,
    changes: broadcast::Sender<StorageChange>,
}

impl SqliteKeyValueStore {
    /// Open (or create) a database file and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path.as_ref()).map_err(|e| {
            StorageError::Backend(format!(
                "failed to open database {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        migrate(&conn)?;
        let (changes, _) = broadcast::channel(256);
        Ok(Self {
            conn: Mutex::new(conn),
            quota: None,
            changes,
        })
    }

    /// Limit the total stored bytes (keys plus values).
    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Schema version recorded in the database.
    pub fn schema_version(&self) -> Result<i32, StorageError> {
        Ok(self
            .conn
            .lock()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Total stored bytes across every namespace.
    pub fn usage(&self) -> Result<usize, StorageError> {
        let conn = self.conn.lock();
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0) FROM kv_store",
            [],
            |row| row.get(0),
        )?;
        Ok(used.max(0) as usize)
    }

    fn publish(&self, namespace: &str, key: Option<&str>) {
        // no receivers is fine
        let _ = self.changes.send(StorageChange {
            namespace: namespace.to_string(),
            key: key.map(str::to_string),
        });
    }
}

fn migrate(conn: &Connection) -> Result<(), StorageError> {
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for version in (current + 1)..=SCHEMA_VERSION {
        match version {
            1 => conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS kv_store (
                    namespace TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (namespace, key)
                );
                ",
            )?,
            _ => {
                return Err(StorageError::Backend(format!(
                    "unknown migration version: {version}"
                )))
            }
        }
        conn.execute_batch(&format!("PRAGMA user_version = {version};"))?;
        tracing::debug!("kv store migrated to schema v{}", version);
    }

    Ok(())
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set(&self, namespace: &str, key: &str, value: String) -> Result<(), StorageError> {
        {
            let conn = self.conn.lock();

            if let Some(quota) = self.quota {
                let (used, existing): (i64, i64) = conn.query_row(
                    "SELECT
                        COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0),
                        COALESCE(SUM(CASE WHEN namespace = ?1 AND key = ?2
                            THEN length(CAST(key AS BLOB)) + length(CAST(value AS BLOB)) ELSE 0 END), 0)
                     FROM kv_store",
                    params![namespace, key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let needed = (used - existing).max(0) as usize + key.len() + value.len();
                if needed > quota {
                    return Err(StorageError::QuotaExceeded { needed, quota });
                }
            }

            conn.execute(
                "INSERT INTO kv_store (namespace, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(namespace, key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                params![namespace, key, value, chrono::Utc::now().to_rfc3339()],
            )?;
        }

        self.publish(namespace, Some(key));
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let removed = self.conn.lock().execute(
            "DELETE FROM kv_store WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        if removed > 0 {
            self.publish(namespace, Some(key));
        }
        Ok(())
    }

    async fn remove_if(&self, namespace: &str, key: &str, expected: &str) -> Result<bool, StorageError> {
        let removed = self.conn.lock().execute(
            "DELETE FROM kv_store WHERE namespace = ?1 AND key = ?2 AND value = ?3",
            params![namespace, key, expected],
        )?;
        if removed > 0 {
            self.publish(namespace, Some(key));
        }
        Ok(removed > 0)
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM kv_store WHERE namespace = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map(params![namespace], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    async fn entries(&self, namespace: &str) -> Result<Vec<(String, String)>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key, value FROM kv_store WHERE namespace = ?1 ORDER BY key")?;
        let entries = stmt
            .query_map(params![namespace], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, String)>, _>>()?;
        Ok(entries)
    }

    async fn clear(&self, namespace: &str) -> Result<(), StorageError> {
        self.conn
            .lock()
            .execute("DELETE FROM kv_store WHERE namespace = ?1", params![namespace])?;
        self.publish(namespace, None);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_set_version() {
        let store = SqliteKeyValueStore::open_in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_set_get_overwrite() {
        let store = SqliteKeyValueStore::open_in_memory().unwrap();
        store.set("cache", "a", "1".to_string()).await.unwrap();
        store.set("cache", "a", "2".to_string()).await.unwrap();
        assert_eq!(store.get("cache", "a").await.unwrap(), Some("2".to_string()));
        assert_eq!(store.get("other", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_if_only_matches_expected_value() {
        let store = SqliteKeyValueStore::open_in_memory().unwrap();
        store.set("cache", "a", "stale".to_string()).await.unwrap();
        store.set("cache", "a", "fresh".to_string()).await.unwrap();

        assert!(!store.remove_if("cache", "a", "stale").await.unwrap());
        assert_eq!(store.get("cache", "a").await.unwrap(), Some("fresh".to_string()));
        assert!(store.remove_if("cache", "a", "fresh").await.unwrap());
        assert_eq!(store.get("cache", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_entries_and_clear_are_namespaced() {
        let store = SqliteKeyValueStore::open_in_memory().unwrap();
        store.set("a", "k2", "v2".to_string()).await.unwrap();
        store.set("a", "k1", "v1".to_string()).await.unwrap();
        store.set("b", "k1", "x".to_string()).await.unwrap();

        assert_eq!(store.keys("a").await.unwrap(), vec!["k1", "k2"]);
        assert_eq!(
            store.entries("a").await.unwrap(),
            vec![("k1".to_string(), "v1".to_string()), ("k2".to_string(), "v2".to_string())]
        );

        store.clear("a").await.unwrap();
        assert!(store.keys("a").await.unwrap().is_empty());
        assert_eq!(store.keys("b").await.unwrap(), vec!["k1"]);
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let store = SqliteKeyValueStore::open_in_memory().unwrap().with_quota(10);
        store.set("ns", "k", "12345".to_string()).await.unwrap();

        let err = store.set("ns", "j", "123456".to_string()).await.unwrap_err();
        assert_eq!(err, StorageError::QuotaExceeded { needed: 13, quota: 10 });

        // replacing an entry only counts the new size
        store.set("ns", "k", "123456789".to_string()).await.unwrap();
        assert_eq!(store.usage().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let store = SqliteKeyValueStore::open_in_memory().unwrap();
        let mut rx = store.subscribe();

        store.set("ns", "k", "v".to_string()).await.unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.namespace, "ns");
        assert_eq!(change.key.as_deref(), Some("k"));

        store.clear("ns").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().key, None);
    }

    #[tokio::test]
    async fn test_file_backed_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.db");

        {
            let store = SqliteKeyValueStore::open(&path).unwrap();
            store.set("sync", "offline_queue", "[]".to_string()).await.unwrap();
        }

        let store = SqliteKeyValueStore::open(&path).unwrap();
        assert_eq!(
            store.get("sync", "offline_queue").await.unwrap(),
            Some("[]".to_string())
        );
    }
}
