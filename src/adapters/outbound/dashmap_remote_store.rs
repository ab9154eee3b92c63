//! DashMap Remote Store
//!
//! In-memory implementation of RemoteStore for development and tests.
//! Reachability can be toggled, failures injected and latency added; every
//! mutation that reaches the store is logged and published.

use crate::domain::entities::{ActionKind, ChangeEvent, RemoteChange};
use crate::domain::ports::RemoteStore;
use crate::domain::value_objects::{merge_records, record_id, Record, Selector, ID_FIELD};
use crate::error::RemoteError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// A mutation that reached the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub collection: String,
    pub kind: ActionKind,
    pub record_id: Option<String>,
}

/// In-memory remote store.
#[derive(Clone)]
pub struct DashMapRemoteStore {
    collections: Arc<DashMap<String, Vec<Record>>>,
    reachable: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
    latency_ms: Arc<AtomicU64>,
    dispatches: Arc<Mutex<Vec<Dispatch>>>,
    changes: broadcast::Sender<RemoteChange>,
}

impl DashMapRemoteStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            collections: Arc::new(DashMap::new()),
            reachable: Arc::new(AtomicBool::new(true)),
            fail_next: Arc::new(AtomicU32::new(0)),
            latency_ms: Arc::new(AtomicU64::new(0)),
            dispatches: Arc::new(Mutex::new(Vec::new())),
            changes,
        }
    }

    /// Toggle reachability; every call fails with a network error while unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make the next `n` calls fail with a network error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Replace a collection's contents without publishing changes.
    pub fn seed(&self, collection: &str, records: Vec<Record>) {
        self.collections.insert(collection.to_string(), records);
    }

    /// Current contents of a collection.
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.collections
            .get(collection)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Fetch a record by identity, bypassing failure injection.
    pub fn record(&self, collection: &str, id: &str) -> Option<Record> {
        let selector = Selector::by_id(id);
        self.records(collection)
            .into_iter()
            .find(|r| selector.matches(r))
    }

    /// Mutations that reached the store, oldest first.
    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.dispatches.lock().clone()
    }

    /// Simulate a write by another client: stores and publishes it.
    pub fn external_upsert(&self, collection: &str, record: Record) {
        let (_, old) = self.put(collection, record.clone());
        self.publish(collection, ChangeEvent::Update, Some(record), old);
    }

    /// Simulate a delete by another client.
    pub fn external_delete(&self, collection: &str, id: &str) {
        let selector = Selector::by_id(id);
        let removed = self.take(collection, &selector);
        for old in removed {
            self.publish(collection, ChangeEvent::Delete, None, Some(old));
        }
    }

    async fn gate(&self) -> Result<(), RemoteError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("remote unreachable".to_string()));
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RemoteError::Network("injected failure".to_string()));
        }

        Ok(())
    }

    fn log(&self, collection: &str, kind: ActionKind, record_id: Option<String>) {
        self.dispatches.lock().push(Dispatch {
            collection: collection.to_string(),
            kind,
            record_id,
        });
    }

    fn publish(&self, collection: &str, event_type: ChangeEvent, new: Option<Record>, old: Option<Record>) {
        let _ = self.changes.send(RemoteChange {
            collection: collection.to_string(),
            event_type,
            new,
            old,
        });
    }

    /// Insert or replace by identity. Returns (inserted, previous).
    fn put(&self, collection: &str, record: Record) -> (bool, Option<Record>) {
        let mut rows = self.collections.entry(collection.to_string()).or_default();
        let id = record_id(&record);
        match rows.iter().position(|r| id.is_some() && record_id(r) == id) {
            Some(idx) => {
                let old = std::mem::replace(&mut rows[idx], record);
                (false, Some(old))
            }
            None => {
                rows.push(record);
                (true, None)
            }
        }
    }

    fn take(&self, collection: &str, selector: &Selector) -> Vec<Record> {
        let Some(mut rows) = self.collections.get_mut(collection) else {
            return Vec::new();
        };
        let (removed, kept): (Vec<Record>, Vec<Record>) =
            rows.drain(..).partition(|r| selector.matches(r));
        *rows = kept;
        removed
    }
}

impl Default for DashMapRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for DashMapRemoteStore {
    async fn insert(&self, collection: &str, mut record: Record) -> Result<Record, RemoteError> {
        self.gate().await?;
        self.log(collection, ActionKind::Insert, record_id(&record));

        if record_id(&record).is_none() {
            record.insert(
                ID_FIELD.to_string(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
        let id = record_id(&record).unwrap_or_default();
        if self.record(collection, &id).is_some() {
            return Err(RemoteError::Rejected(format!(
                "duplicate key value violates unique constraint: {id}"
            )));
        }

        self.put(collection, record.clone());
        self.publish(collection, ChangeEvent::Insert, Some(record.clone()), None);
        Ok(record)
    }

    async fn update(
        &self,
        collection: &str,
        patch: Record,
        selector: &Selector,
    ) -> Result<Vec<Record>, RemoteError> {
        self.gate().await?;
        self.log(collection, ActionKind::Update, selector.id());

        let mut changed = Vec::new();
        if let Some(mut rows) = self.collections.get_mut(collection) {
            for row in rows.iter_mut().filter(|r| selector.matches(r)) {
                let old = row.clone();
                *row = merge_records(row, &patch);
                changed.push((row.clone(), old));
            }
        }

        for (new, old) in &changed {
            self.publish(collection, ChangeEvent::Update, Some(new.clone()), Some(old.clone()));
        }
        Ok(changed.into_iter().map(|(new, _)| new).collect())
    }

    async fn delete(&self, collection: &str, selector: &Selector) -> Result<Vec<Record>, RemoteError> {
        self.gate().await?;
        self.log(collection, ActionKind::Delete, selector.id());

        let removed = self.take(collection, selector);
        for old in &removed {
            self.publish(collection, ChangeEvent::Delete, None, Some(old.clone()));
        }
        Ok(removed)
    }

    async fn upsert(&self, collection: &str, record: Record) -> Result<Record, RemoteError> {
        self.gate().await?;
        self.log(collection, ActionKind::Upsert, record_id(&record));

        if record_id(&record).is_none() {
            return Err(RemoteError::Rejected("upsert requires an id".to_string()));
        }

        let (inserted, old) = self.put(collection, record.clone());
        let event = if inserted {
            ChangeEvent::Insert
        } else {
            ChangeEvent::Update
        };
        self.publish(collection, event, Some(record.clone()), old);
        Ok(record)
    }

    async fn select(
        &self,
        collection: &str,
        selector: Option<&Selector>,
    ) -> Result<Vec<Record>, RemoteError> {
        self.gate().await?;
        Ok(self
            .records(collection)
            .into_iter()
            .filter(|r| selector.map_or(true, |s| s.matches(r)))
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteChange> {
        self.changes.subscribe()
    }
}
