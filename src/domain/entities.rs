//! Domain Entities - Core business objects
//!
//! Cache entries, queued actions and conflicts. These types carry only
//! data and the invariants attached to it; persistence and orchestration
//! live in the infrastructure and application layers.

use crate::domain::value_objects::{Record, Selector};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Current on-disk format of cache entries. Entries with another version are misses.
pub const CACHE_FORMAT_VERSION: &str = "1";

/// A persisted cache entry.
///
/// An entry is logically absent once `now - created_at > ttl`, even while
/// it is still physically stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Serialized value, possibly compressed and base64 encoded
    #[serde(rename = "data")]
    pub payload: String,
    /// Creation time in epoch milliseconds
    #[serde(rename = "timestamp")]
    pub created_at_ms: i64,
    /// Time-to-live in milliseconds (None = never expires)
    #[serde(rename = "ttl", default)]
    pub ttl_ms: Option<u64>,
    pub version: String,
    #[serde(default)]
    pub compressed: bool,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, payload: String, ttl: Option<Duration>, compressed: bool) -> Self {
        Self {
            key: key.into(),
            payload,
            created_at_ms: Utc::now().timestamp_millis(),
            ttl_ms: ttl.map(|t| t.as_millis() as u64),
            version: CACHE_FORMAT_VERSION.to_string(),
            compressed,
        }
    }

    /// Check expiry against a reference time in epoch milliseconds.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        match self.ttl_ms {
            Some(ttl) => now_ms.saturating_sub(self.created_at_ms) > ttl as i64,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp_millis())
    }
}

/// Mutation kind of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Insert,
    Update,
    Delete,
    Upsert,
}

impl ActionKind {
    /// Priority assigned when the caller does not pick one.
    pub fn default_priority(&self) -> ActionPriority {
        match self {
            Self::Delete => ActionPriority::High,
            Self::Insert | Self::Update | Self::Upsert => ActionPriority::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Upsert => "upsert",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority. Declaration order is dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionPriority {
    High,
    Normal,
    Low,
}

impl Default for ActionPriority {
    fn default() -> Self {
        ActionPriority::Normal
    }
}

/// Lifecycle of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Processing,
    Failed,
    Completed,
}

impl Default for ActionStatus {
    fn default() -> Self {
        ActionStatus::Pending
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// A mutation waiting to reach the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    pub id: String,
    pub kind: ActionKind,
    /// Collection the mutation targets
    pub target: String,
    pub payload: Option<Record>,
    pub selector: Option<Selector>,
    pub priority: ActionPriority,
    pub status: ActionStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest time a retried action may be dispatched again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

impl QueuedAction {
    /// Identity of the record this action targets, if known.
    pub fn record_id(&self) -> Option<String> {
        self.selector
            .as_ref()
            .and_then(Selector::id)
            .or_else(|| self.payload.as_ref().and_then(crate::domain::value_objects::record_id))
    }

    /// Whether another failure would be terminal.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Whether the action may be dispatched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ActionStatus::Pending && self.retry_at.map_or(true, |t| t <= now)
    }
}

/// Caller request to enqueue a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub kind: ActionKind,
    pub target: String,
    pub payload: Option<Record>,
    pub selector: Option<Selector>,
    pub priority: Option<ActionPriority>,
    pub max_attempts: Option<u32>,
}

impl NewAction {
    pub fn new(kind: ActionKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            payload: None,
            selector: None,
            priority: None,
            max_attempts: None,
        }
    }

    pub fn insert(target: impl Into<String>, record: Record) -> Self {
        Self::new(ActionKind::Insert, target).payload(record)
    }

    pub fn upsert(target: impl Into<String>, record: Record) -> Self {
        Self::new(ActionKind::Upsert, target).payload(record)
    }

    pub fn update(target: impl Into<String>, patch: Record, selector: Selector) -> Self {
        Self::new(ActionKind::Update, target).payload(patch).selector(selector)
    }

    pub fn delete(target: impl Into<String>, selector: Selector) -> Self {
        Self::new(ActionKind::Delete, target).selector(selector)
    }

    pub fn payload(mut self, record: Record) -> Self {
        self.payload = Some(record);
        self
    }

    pub fn selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn priority(mut self, priority: ActionPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }
}

/// Category of divergence between a local and a remote snapshot.
///
/// Older labels are accepted on load: `version_conflict` maps to
/// `VersionMismatch`, `update_conflict` and `concurrent_update` map to
/// `ConcurrentModification`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    #[serde(alias = "version_conflict")]
    VersionMismatch,
    TimestampConflict,
    #[serde(alias = "update_conflict", alias = "concurrent_update")]
    ConcurrentModification,
    DeleteConflict,
    FieldLevel,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VersionMismatch => "version_mismatch",
            Self::TimestampConflict => "timestamp_conflict",
            Self::ConcurrentModification => "concurrent_modification",
            Self::DeleteConflict => "delete_conflict",
            Self::FieldLevel => "field_level",
        }
    }
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    /// Replaced by a newer detection on the same record; kept until cleanup
    Superseded,
}

/// A detected divergence awaiting (or after) resolution.
///
/// `conflicting_fields` is never empty unless `kind` is `DeleteConflict`.
/// A pending conflict is closed exactly once, either `Resolved` or
/// `Superseded`, and is immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub collection: String,
    pub record_id: String,
    pub kind: ConflictKind,
    pub local_snapshot: Record,
    /// None when the record was deleted remotely
    pub remote_snapshot: Option<Record>,
    pub conflicting_fields: Vec<String>,
    pub priority: ConflictPriority,
    pub status: ConflictStatus,
    pub detected_at: DateTime<Utc>,
    /// When the conflict was closed (resolved or superseded)
    pub resolved_at: Option<DateTime<Utc>>,
    /// Strategy name recorded on resolution
    pub resolution: Option<String>,
    /// Id of the conflict that replaced this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

impl Conflict {
    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }

    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }
}

/// Kind of change notification from the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeEvent {
    Insert,
    Update,
    Delete,
}

/// A remote-originated change to one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub collection: String,
    pub event_type: ChangeEvent,
    pub new: Option<Record>,
    pub old: Option<Record>,
}

impl RemoteChange {
    /// Identity of the affected record.
    pub fn record_id(&self) -> Option<String> {
        self.new
            .as_ref()
            .and_then(crate::domain::value_objects::record_id)
            .or_else(|| self.old.as_ref().and_then(crate::domain::value_objects::record_id))
    }
}

/// Notification that a persisted key changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub namespace: String,
    /// None when the whole namespace was cleared
    pub key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::Selector;
    use serde_json::json;

    #[test]
    fn test_cache_entry_expiry() {
        let mut entry = CacheEntry::new("k", "v".to_string(), Some(Duration::from_millis(100)), false);
        let created = entry.created_at_ms;
        assert!(!entry.is_expired_at(created + 100));
        assert!(entry.is_expired_at(created + 101));

        entry.ttl_ms = None;
        assert!(!entry.is_expired_at(created + 1_000_000));
    }

    #[test]
    fn test_cache_entry_wire_shape() {
        let entry = CacheEntry::new("k", "payload".to_string(), None, true);
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["key"], json!("k"));
        assert_eq!(v["data"], json!("payload"));
        assert_eq!(v["version"], json!(CACHE_FORMAT_VERSION));
        assert_eq!(v["compressed"], json!(true));
        assert!(v["timestamp"].is_i64());
        assert!(v["ttl"].is_null());
    }

    #[test]
    fn test_default_priority_by_kind() {
        assert_eq!(ActionKind::Delete.default_priority(), ActionPriority::High);
        assert_eq!(ActionKind::Insert.default_priority(), ActionPriority::Normal);
        assert_eq!(ActionKind::Update.default_priority(), ActionPriority::Normal);
        assert_eq!(ActionKind::Upsert.default_priority(), ActionPriority::Normal);
    }

    #[test]
    fn test_priority_ordering() {
        let mut p = vec![ActionPriority::Low, ActionPriority::High, ActionPriority::Normal];
        p.sort();
        assert_eq!(p, vec![ActionPriority::High, ActionPriority::Normal, ActionPriority::Low]);
    }

    #[test]
    fn test_new_action_builders() {
        let patch = json!({"price": 3}).as_object().cloned().unwrap();
        let action = NewAction::update("products", patch, Selector::by_id("p1"))
            .priority(ActionPriority::Low)
            .max_attempts(5);
        assert_eq!(action.kind, ActionKind::Update);
        assert_eq!(action.target, "products");
        assert_eq!(action.priority, Some(ActionPriority::Low));
        assert_eq!(action.max_attempts, Some(5));
        assert_eq!(action.selector.unwrap().id(), Some("p1".to_string()));
    }

    #[test]
    fn test_conflict_kind_legacy_aliases() {
        let k: ConflictKind = serde_json::from_str("\"version_conflict\"").unwrap();
        assert_eq!(k, ConflictKind::VersionMismatch);
        let k: ConflictKind = serde_json::from_str("\"concurrent_update\"").unwrap();
        assert_eq!(k, ConflictKind::ConcurrentModification);
        let k: ConflictKind = serde_json::from_str("\"update_conflict\"").unwrap();
        assert_eq!(k, ConflictKind::ConcurrentModification);
        assert_eq!(
            serde_json::to_string(&ConflictKind::DeleteConflict).unwrap(),
            "\"delete_conflict\""
        );
    }

    #[test]
    fn test_remote_change_record_id_falls_back_to_old() {
        let change = RemoteChange {
            collection: "products".to_string(),
            event_type: ChangeEvent::Delete,
            new: None,
            old: json!({"id": "p9"}).as_object().cloned(),
        };
        assert_eq!(change.record_id(), Some("p9".to_string()));
    }
}
