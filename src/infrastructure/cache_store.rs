//! Cache Store
//!
//! TTL-aware, optionally compressed key/value cache layered on a
//! `KeyValueStore`. Each logical store maps to its own namespace.
//!
//! Expired entries are logically absent: `get` never returns them and
//! schedules their removal, and `cleanup` sweeps them in bulk.

use crate::domain::entities::{CacheEntry, CACHE_FORMAT_VERSION};
use crate::domain::ports::KeyValueStore;
use crate::error::{ConfigError, StorageError};
use crate::infrastructure::codec::{PayloadCodec, DEFAULT_COMPRESSION_THRESHOLD};
use chrono::Utc;
use dashmap::DashSet;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const NAMESPACE_PREFIX: &str = "cache:";

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without one (None = never expires)
    pub default_ttl: Option<Duration>,
    /// Whether large payloads are compressed
    pub compression: bool,
    /// Payloads shorter than this are never compressed
    pub compression_threshold: usize,
    /// Interval of the background expiry sweep
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(Duration::from_secs(24 * 60 * 60)),
            compression: true,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::InvalidInterval("cleanup_interval"));
        }
        Ok(())
    }
}

/// Read state of a persisted entry.
enum Lookup {
    /// Entry plus the raw blob it was parsed from
    Live(CacheEntry, String),
    /// Expired or unreadable; carries the raw blob for conditional eviction
    Stale(String),
    Missing,
}

/// TTL cache over a key/value store.
pub struct CacheStore {
    kv: Arc<dyn KeyValueStore>,
    config: CacheConfig,
    codec: PayloadCodec,
    stores: DashSet<String>,
}

impl CacheStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: CacheConfig) -> Self {
        let codec = PayloadCodec::new(config.compression, config.compression_threshold);
        Self {
            kv,
            config,
            codec,
            stores: DashSet::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Store a value, replacing any previous entry and resetting its age.
    ///
    /// `ttl` of None applies the configured default.
    pub async fn set<T>(&self, store: &str, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), StorageError>
    where
        T: Serialize + ?Sized,
    {
        let raw = serde_json::to_string(value)?;
        let (payload, compressed) = self.codec.encode(raw);
        let entry = CacheEntry::new(key, payload, ttl.or(self.config.default_ttl), compressed);

        self.stores.insert(store.to_string());
        self.kv
            .set(&namespace(store), key, serde_json::to_string(&entry)?)
            .await
    }

    /// Read a value. Expired or unreadable entries are misses and are removed in the background.
    pub async fn get<T>(&self, store: &str, key: &str) -> Result<Option<T>, StorageError>
    where
        T: DeserializeOwned,
    {
        let (entry, raw) = match self.lookup(store, key).await? {
            Lookup::Live(entry, raw) => (entry, raw),
            Lookup::Stale(raw) => {
                self.evict(store, key, raw);
                return Ok(None);
            }
            Lookup::Missing => return Ok(None),
        };

        let decoded = self
            .codec
            .decode(&entry.payload, entry.compressed)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()));

        match decoded {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!("malformed cache payload {}/{}: {}", store, key, e);
                self.evict(store, key, raw);
                Ok(None)
            }
        }
    }

    /// Whether a live entry exists.
    pub async fn has(&self, store: &str, key: &str) -> Result<bool, StorageError> {
        Ok(matches!(self.lookup(store, key).await?, Lookup::Live(..)))
    }

    pub async fn delete(&self, store: &str, key: &str) -> Result<(), StorageError> {
        self.kv.remove(&namespace(store), key).await
    }

    /// Remove every entry of a store.
    pub async fn clear(&self, store: &str) -> Result<(), StorageError> {
        self.kv.clear(&namespace(store)).await
    }

    /// Keys of live entries, ascending.
    pub async fn keys(&self, store: &str) -> Result<Vec<String>, StorageError> {
        let now = Utc::now().timestamp_millis();
        let entries = self.kv.entries(&namespace(store)).await?;
        Ok(entries
            .into_iter()
            .filter(|(_, raw)| matches!(parse_entry(raw), Some(e) if !e.is_expired_at(now)))
            .map(|(key, _)| key)
            .collect())
    }

    /// Remove expired and unreadable entries. Returns how many were removed.
    pub async fn cleanup(&self, store: &str) -> Result<usize, StorageError> {
        let ns = namespace(store);
        let now = Utc::now().timestamp_millis();
        let mut removed = 0;

        for (key, raw) in self.kv.entries(&ns).await? {
            let stale = match parse_entry(&raw) {
                Some(entry) => entry.is_expired_at(now),
                None => true,
            };
            // skip entries rewritten since the scan
            if stale && self.kv.remove_if(&ns, &key, &raw).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!("cache cleanup removed {} entries from {}", removed, store);
        }
        Ok(removed)
    }

    /// Bytes held by a store (keys plus persisted entries).
    pub async fn approximate_size(&self, store: &str) -> Result<usize, StorageError> {
        Ok(self
            .kv
            .entries(&namespace(store))
            .await?
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum())
    }

    /// Stores written through this instance.
    pub fn known_stores(&self) -> Vec<String> {
        let mut stores: Vec<String> = self.stores.iter().map(|s| s.key().clone()).collect();
        stores.sort();
        stores
    }

    /// Start the background expiry sweep over every known store.
    ///
    /// Runs until the shutdown signal fires.
    pub fn start_cleanup(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = cache.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for store in cache.known_stores() {
                            if let Err(e) = cache.cleanup(&store).await {
                                tracing::warn!("cache cleanup of {} failed: {}", store, e);
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("cache cleanup loop stopped");
                        break;
                    }
                }
            }
        })
    }

    async fn lookup(&self, store: &str, key: &str) -> Result<Lookup, StorageError> {
        let Some(raw) = self.kv.get(&namespace(store), key).await? else {
            return Ok(Lookup::Missing);
        };

        match parse_entry(&raw) {
            Some(entry) if !entry.is_expired() => Ok(Lookup::Live(entry, raw)),
            Some(_) => Ok(Lookup::Stale(raw)),
            None => {
                tracing::warn!("malformed cache entry {}/{}", store, key);
                Ok(Lookup::Stale(raw))
            }
        }
    }

    /// Remove a stale entry without blocking the reader.
    ///
    /// Only the exact blob that was read is removed; a value written in the
    /// meantime survives.
    fn evict(&self, store: &str, key: &str, stale: String) {
        let kv = Arc::clone(&self.kv);
        let ns = namespace(store);
        let key = key.to_string();
        tokio::spawn(async move {
            match kv.remove_if(&ns, &key, &stale).await {
                Ok(true) => {}
                Ok(false) => tracing::debug!("{}/{} rewritten before eviction; kept", ns, key),
                Err(e) => tracing::warn!("failed to evict {}/{}: {}", ns, key, e),
            }
        });
    }
}

fn namespace(store: &str) -> String {
    format!("{NAMESPACE_PREFIX}{store}")
}

/// Parse a persisted entry; unknown format versions count as unreadable.
fn parse_entry(raw: &str) -> Option<CacheEntry> {
    serde_json::from_str::<CacheEntry>(raw)
        .ok()
        .filter(|e| e.version == CACHE_FORMAT_VERSION)
}
