//! Remote Store Port
//!
//! Defines the interface of the authoritative remote data store.

use crate::domain::entities::RemoteChange;
use crate::domain::value_objects::{Record, Selector};
use crate::error::RemoteError;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// CRUD over named collections of schemaless records.
///
/// This is an outbound port. Every call resolves to either the
/// authoritative data or an error, never both.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert a record, returning it as stored remotely.
    async fn insert(&self, collection: &str, record: Record) -> Result<Record, RemoteError>;

    /// Apply a patch to every record matching the selector.
    async fn update(
        &self,
        collection: &str,
        patch: Record,
        selector: &Selector,
    ) -> Result<Vec<Record>, RemoteError>;

    /// Delete every record matching the selector, returning the removed records.
    async fn delete(&self, collection: &str, selector: &Selector) -> Result<Vec<Record>, RemoteError>;

    /// Insert or replace a record by identity.
    async fn upsert(&self, collection: &str, record: Record) -> Result<Record, RemoteError>;

    /// Fetch records, optionally filtered.
    async fn select(
        &self,
        collection: &str,
        selector: Option<&Selector>,
    ) -> Result<Vec<Record>, RemoteError>;

    /// Subscribe to change notifications for every collection.
    fn subscribe(&self) -> broadcast::Receiver<RemoteChange>;
}
