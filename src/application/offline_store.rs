//! Offline Store - per-collection application use case
//!
//! Reads go through the cache, writes are applied locally first and then
//! either sent to the remote store directly or queued for later. What a
//! caller sees is always the cached base with every still-queued action
//! overlaid on top.

use crate::domain::entities::{
    ActionKind, ActionPriority, ChangeEvent, Conflict, NewAction, QueuedAction, RemoteChange,
};
use crate::domain::ports::{ConnectivitySource, RemoteStore};
use crate::domain::services::OptimisticOverlay;
use crate::domain::value_objects::{merge_records, record_id, Record, Selector, ID_FIELD};
use crate::error::{ConfigError, RemoteError};
use crate::infrastructure::{ActionQueue, CacheStore, ConflictEngine};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Cache key holding the collection's full base list.
const ALL_KEY: &str = "__all__";

/// Per-collection store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub collection: String,
    /// TTL of cached records (None = cache default)
    pub cache_ttl: Option<Duration>,
    /// Timeout of direct remote calls (default: 10s)
    pub remote_timeout: Duration,
}

impl StoreConfig {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            cache_ttl: None,
            remote_timeout: Duration::from_secs(10),
        }
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.trim().is_empty() {
            return Err(ConfigError::MissingCollection);
        }
        if self.remote_timeout.is_zero() {
            return Err(ConfigError::InvalidInterval("remote_timeout"));
        }
        Ok(())
    }
}

/// Derived synchronisation state of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    /// Queued actions still owed to the remote
    pub pending_changes: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Offline-first store for one collection.
pub struct OfflineStore {
    config: StoreConfig,
    cache: Arc<CacheStore>,
    queue: Arc<ActionQueue>,
    conflicts: Arc<ConflictEngine>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn ConnectivitySource>,
    /// Serializes read-modify-write of the cached base list
    cache_lock: Mutex<()>,
    syncing: AtomicBool,
    last_sync_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
}

impl OfflineStore {
    pub fn new(
        config: StoreConfig,
        cache: Arc<CacheStore>,
        queue: Arc<ActionQueue>,
        conflicts: Arc<ConflictEngine>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn ConnectivitySource>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            cache,
            queue,
            conflicts,
            remote,
            connectivity,
            cache_lock: Mutex::new(()),
            syncing: AtomicBool::new(false),
            last_sync_at: RwLock::new(None),
            last_error: RwLock::new(None),
        })
    }

    pub fn collection(&self) -> &str {
        &self.config.collection
    }

    /// Read one record.
    ///
    /// Online, the remote copy replaces the cached one first; on remote
    /// failure the cached copy is served. Pending actions are overlaid.
    pub async fn read(&self, id: &str) -> Option<Record> {
        let mut base = self.cached(id).await;

        if self.connectivity.is_online() {
            let selector = Selector::by_id(id);
            match self.call(self.remote.select(self.collection(), Some(&selector))).await {
                Ok(rows) => {
                    base = rows.into_iter().next();
                    match &base {
                        Some(record) => self.put_cached(record).await,
                        None => self.drop_cached(id).await,
                    }
                }
                Err(e) => self.note_error(format!("read {id}: {e}")),
            }
        }

        let pending = self.queue.pending_for(self.collection()).await;
        OptimisticOverlay::apply_one(base.as_ref(), id, &pending)
    }

    /// Read the whole collection, refreshing from the remote when online.
    pub async fn read_all(&self) -> Vec<Record> {
        if self.connectivity.is_online() {
            match self.refresh().await {
                Ok(view) => return view,
                Err(e) => tracing::debug!("serving {} from cache: {}", self.collection(), e),
            }
        }
        self.view().await
    }

    /// Replace the cached collection with the remote one. Returns the overlaid view.
    pub async fn refresh(&self) -> Result<Vec<Record>, RemoteError> {
        if !self.connectivity.is_online() {
            return Err(RemoteError::Network("offline".to_string()));
        }

        self.syncing.store(true, Ordering::SeqCst);
        let fetched = self.call(self.remote.select(self.collection(), None)).await;
        self.syncing.store(false, Ordering::SeqCst);

        let rows = fetched.map_err(|e| {
            self.note_error(format!("refresh: {e}"));
            e
        })?;

        {
            let _guard = self.cache_lock.lock().await;
            let store = self.collection();
            let ttl = self.config.cache_ttl;
            let written = async {
                self.cache.clear(store).await?;
                for record in &rows {
                    if let Some(id) = record_id(record) {
                        self.cache.set(store, &id, record, ttl).await?;
                    }
                }
                self.cache.set(store, ALL_KEY, &rows, ttl).await
            }
            .await;
            if let Err(e) = written {
                self.note_error(format!("cache write: {e}"));
            }
        }

        *self.last_sync_at.write() = Some(Utc::now());
        tracing::debug!("refreshed {}: {} records", self.collection(), rows.len());

        let pending = self.queue.pending_for(self.collection()).await;
        Ok(OptimisticOverlay::apply(&rows, &pending))
    }

    /// Create a record. Records without an `id` get a generated one.
    ///
    /// Returns the record as the caller should see it: the authoritative
    /// copy when the remote accepted it directly, the optimistic one otherwise.
    pub async fn create(&self, mut record: Record) -> Record {
        let id = match record_id(&record) {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                record.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                id
            }
        };
        self.put_cached(&record).await;

        if self.should_dispatch(&id).await {
            match self.call(self.remote.insert(self.collection(), record.clone())).await {
                Ok(stored) => {
                    self.put_cached(&stored).await;
                    *self.last_sync_at.write() = Some(Utc::now());
                    return stored;
                }
                Err(e) => self.note_error(format!("create {id}: {e}")),
            }
        }

        self.defer(NewAction::insert(self.collection(), record.clone())).await;
        record
    }

    /// Shallow-merge a patch into a record.
    ///
    /// Returns the updated view, or None when the record is unknown locally
    /// and the remote returned nothing.
    pub async fn update(&self, id: &str, patch: Record) -> Option<Record> {
        let current = self.view_of(id).await;
        let optimistic = current.as_ref().map(|c| merge_records(c, &patch));
        if let Some(record) = &optimistic {
            self.put_cached(record).await;
        }

        if self.should_dispatch(id).await {
            let selector = Selector::by_id(id);
            match self
                .call(self.remote.update(self.collection(), patch.clone(), &selector))
                .await
            {
                Ok(rows) => {
                    *self.last_sync_at.write() = Some(Utc::now());
                    return match rows.into_iter().next() {
                        Some(stored) => {
                            self.put_cached(&stored).await;
                            Some(stored)
                        }
                        None => optimistic,
                    };
                }
                Err(e) => self.note_error(format!("update {id}: {e}")),
            }
        }

        self.defer(NewAction::update(self.collection(), patch, Selector::by_id(id)))
            .await;
        optimistic
    }

    /// Delete a record.
    pub async fn delete(&self, id: &str) {
        self.drop_cached(id).await;

        if self.should_dispatch(id).await {
            let selector = Selector::by_id(id);
            match self.call(self.remote.delete(self.collection(), &selector)).await {
                Ok(_) => {
                    *self.last_sync_at.write() = Some(Utc::now());
                    return;
                }
                Err(e) => self.note_error(format!("delete {id}: {e}")),
            }
        }

        self.defer(
            NewAction::delete(self.collection(), Selector::by_id(id)).priority(ActionPriority::High),
        )
        .await;
    }

    /// Drop every cached record of this collection.
    pub async fn clear_cache(&self) {
        let _guard = self.cache_lock.lock().await;
        if let Err(e) = self.cache.clear(self.collection()).await {
            self.note_error(format!("clear cache: {e}"));
        }
    }

    pub async fn sync_status(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.connectivity.is_online(),
            is_syncing: self.syncing.load(Ordering::SeqCst) || self.queue.is_processing(),
            pending_changes: self.queue.pending_for(self.collection()).await.len(),
            last_sync_at: *self.last_sync_at.read(),
            last_error: self
                .last_error
                .read()
                .clone()
                .or_else(|| self.queue.last_error()),
        }
    }

    /// Apply a change notification from the remote.
    ///
    /// Records with queued local changes go through conflict detection
    /// instead of being overwritten. Returns the conflict, if one was raised.
    pub async fn apply_remote_change(&self, change: &RemoteChange) -> Option<Conflict> {
        if change.collection != self.collection() {
            return None;
        }
        let id = change.record_id()?;

        if !self.pending_for_record(&id).await.is_empty() {
            if let Some(local) = self.view_of(&id).await {
                let conflict = self
                    .conflicts
                    .detect(self.collection(), &local, change.new.as_ref())
                    .await;
                if let Some(c) = &conflict {
                    if c.is_resolved() {
                        self.settle_conflict(c).await;
                    }
                }
                return conflict;
            }
        }

        match (change.event_type, &change.new) {
            (ChangeEvent::Delete, _) | (_, None) => self.drop_cached(&id).await,
            (_, Some(record)) => self.put_cached(record).await,
        }
        None
    }

    /// Apply a queued action the remote accepted.
    pub async fn reconcile_action(&self, action: &QueuedAction, response: &[Record]) {
        if action.target != self.collection() {
            return;
        }

        match action.kind {
            ActionKind::Delete => {
                if let Some(id) = action.record_id() {
                    self.drop_cached(&id).await;
                }
            }
            ActionKind::Insert | ActionKind::Upsert | ActionKind::Update => {
                // placeholder keyed by the action id
                if action.kind == ActionKind::Insert && action.record_id().is_none() {
                    self.drop_cached(&action.id).await;
                }
                for record in response {
                    self.put_cached(record).await;
                }
            }
        }
        *self.last_sync_at.write() = Some(Utc::now());
    }

    /// Bring local state in line with a resolved conflict.
    ///
    /// The committed resolution supersedes the record's queued actions; the
    /// cached copy is re-read from the remote.
    pub async fn settle_conflict(&self, conflict: &Conflict) {
        if conflict.collection != self.collection() || !conflict.is_resolved() {
            return;
        }

        for action in self.pending_for_record(&conflict.record_id).await {
            self.queue.remove(&action.id).await;
        }

        let selector = Selector::by_id(&conflict.record_id);
        match self.call(self.remote.select(self.collection(), Some(&selector))).await {
            Ok(rows) => match rows.into_iter().next() {
                Some(record) => self.put_cached(&record).await,
                None => self.drop_cached(&conflict.record_id).await,
            },
            Err(e) => self.note_error(format!("settle {}: {e}", conflict.record_id)),
        }
    }

    /// Cached base list with pending actions overlaid.
    async fn view(&self) -> Vec<Record> {
        let base: Vec<Record> = match self.cache.get(self.collection(), ALL_KEY).await {
            Ok(list) => list.unwrap_or_default(),
            Err(e) => {
                self.note_error(format!("cache read: {e}"));
                Vec::new()
            }
        };
        let pending = self.queue.pending_for(self.collection()).await;
        OptimisticOverlay::apply(&base, &pending)
    }

    async fn view_of(&self, id: &str) -> Option<Record> {
        let base = self.cached(id).await;
        let pending = self.queue.pending_for(self.collection()).await;
        OptimisticOverlay::apply_one(base.as_ref(), id, &pending)
    }

    async fn cached(&self, id: &str) -> Option<Record> {
        match self.cache.get(self.collection(), id).await {
            Ok(record) => record,
            Err(e) => {
                self.note_error(format!("cache read {id}: {e}"));
                None
            }
        }
    }

    async fn pending_for_record(&self, id: &str) -> Vec<QueuedAction> {
        self.queue
            .pending_for(self.collection())
            .await
            .into_iter()
            .filter(|a| a.record_id().as_deref() == Some(id))
            .collect()
    }

    /// Direct dispatch only when online and nothing is queued ahead for the record.
    async fn should_dispatch(&self, id: &str) -> bool {
        self.connectivity.is_online() && self.pending_for_record(id).await.is_empty()
    }

    async fn defer(&self, action: NewAction) {
        let kind = action.kind;
        match self.queue.enqueue(action).await {
            Ok(id) => tracing::debug!("{} on {} deferred to queue (id={})", kind, self.collection(), id),
            Err(e) => self.note_error(format!("enqueue: {e}")),
        }
    }

    async fn put_cached(&self, record: &Record) {
        let Some(id) = record_id(record) else {
            return;
        };
        let _guard = self.cache_lock.lock().await;
        let store = self.collection();
        let ttl = self.config.cache_ttl;

        let written = async {
            self.cache.set(store, &id, record, ttl).await?;
            let mut all: Vec<Record> = self.cache.get(store, ALL_KEY).await?.unwrap_or_default();
            match all.iter().position(|r| record_id(r).as_deref() == Some(id.as_str())) {
                Some(idx) => all[idx] = record.clone(),
                None => all.insert(0, record.clone()),
            }
            self.cache.set(store, ALL_KEY, &all, ttl).await
        }
        .await;

        if let Err(e) = written {
            self.note_error(format!("cache write {id}: {e}"));
        }
    }

    async fn drop_cached(&self, id: &str) {
        let _guard = self.cache_lock.lock().await;
        let store = self.collection();

        let written = async {
            self.cache.delete(store, id).await?;
            if let Some(mut all) = self.cache.get::<Vec<Record>>(store, ALL_KEY).await? {
                all.retain(|r| record_id(r).as_deref() != Some(id));
                self.cache.set(store, ALL_KEY, &all, self.config.cache_ttl).await?;
            }
            Ok::<(), crate::error::StorageError>(())
        }
        .await;

        if let Err(e) = written {
            self.note_error(format!("cache delete {id}: {e}"));
        }
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        let timeout = self.config.remote_timeout;
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| RemoteError::Timeout(timeout))?
    }

    fn note_error(&self, message: String) {
        tracing::warn!("{}: {}", self.collection(), message);
        *self.last_error.write() = Some(message);
    }
}
