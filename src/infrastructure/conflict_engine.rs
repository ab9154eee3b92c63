//! Conflict Engine
//!
//! Stateful side of conflict handling: records detected conflicts, commits
//! resolutions to the remote store and runs bounded auto-resolution.
//! Diffing, classification and the strategies themselves live in the
//! domain services.

use crate::domain::entities::{Conflict, ConflictKind, ConflictPriority, ConflictStatus};
use crate::domain::ports::{KeyValueStore, RemoteStore};
use crate::domain::services::{ConflictDetector, ConflictResolver, DetectionRules, Resolution};
use crate::domain::value_objects::{record_id, Record, ResolutionStrategy};
use crate::error::{ConfigError, ConflictError, RemoteError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Namespace holding persisted conflicts.
pub const CONFLICT_NAMESPACE: &str = "sync";
/// Key holding persisted conflicts.
pub const CONFLICT_KEY: &str = "conflicts";

/// Conflict engine configuration.
#[derive(Debug, Clone)]
pub struct ConflictConfig {
    pub rules: DetectionRules,
    /// Resolve new conflicts with `default_strategy` as they are detected
    pub auto_resolve: bool,
    pub default_strategy: ResolutionStrategy,
    /// Auto-resolutions allowed per session (default: 100)
    pub max_auto_resolutions: usize,
    /// Consecutive commit failures that pause auto-resolution (default: 3)
    pub max_consecutive_failures: u32,
    /// Unresolved conflicts older than this are purged (default: 7 days)
    pub max_age: Duration,
    /// Resolved conflicts are kept this long for audit (default: 24h)
    pub retention: Duration,
    /// Timeout applied to resolution commits (default: 10s)
    pub remote_timeout: Duration,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            rules: DetectionRules::default(),
            auto_resolve: false,
            default_strategy: ResolutionStrategy::TimestampWins,
            max_auto_resolutions: 100,
            max_consecutive_failures: 3,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
            remote_timeout: Duration::from_secs(10),
        }
    }
}

impl ConflictConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rules(mut self, rules: DetectionRules) -> Self {
        self.rules = rules;
        self
    }

    /// Enable auto-resolution with the given strategy.
    pub fn auto_resolve(mut self, strategy: ResolutionStrategy) -> Self {
        self.auto_resolve = true;
        self.default_strategy = strategy;
        self
    }

    pub fn max_auto_resolutions(mut self, max: usize) -> Self {
        self.max_auto_resolutions = max;
        self
    }

    pub fn max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = age;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        if self.remote_timeout.is_zero() {
            return Err(ConfigError::InvalidInterval("remote_timeout"));
        }
        if self.rules.concurrency_window.is_zero() {
            return Err(ConfigError::InvalidInterval("concurrency_window"));
        }
        Ok(())
    }
}

/// Aggregate view over recorded conflicts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictStats {
    pub total: usize,
    pub pending: usize,
    pub resolved: usize,
    pub superseded: usize,
    pub by_kind: HashMap<ConflictKind, usize>,
    pub by_priority: HashMap<ConflictPriority, usize>,
    /// Conflicts resolved automatically this session
    pub auto_resolved: usize,
    pub auto_resolution_paused: bool,
}

#[derive(Debug, Clone)]
pub enum ConflictEvent {
    Detected(Conflict),
    Resolved(Conflict),
    Superseded { id: String, by: String },
    ResolutionFailed { id: String, error: ConflictError },
    AutoResolutionPaused { consecutive_failures: u32 },
}

#[derive(Debug, Default)]
struct AutoResolution {
    resolved: usize,
    consecutive_failures: u32,
    paused: bool,
}

/// Conflict detection and resolution engine.
pub struct ConflictEngine {
    kv: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteStore>,
    config: ConflictConfig,
    conflicts: Mutex<Vec<Conflict>>,
    auto: SyncMutex<AutoResolution>,
    /// Ids of conflicts whose resolution is committing
    in_flight: SyncMutex<HashSet<String>>,
    events: broadcast::Sender<ConflictEvent>,
}

impl ConflictEngine {
    pub fn new(kv: Arc<dyn KeyValueStore>, remote: Arc<dyn RemoteStore>, config: ConflictConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            kv,
            remote,
            config,
            conflicts: Mutex::new(Vec::new()),
            auto: SyncMutex::new(AutoResolution::default()),
            in_flight: SyncMutex::new(HashSet::new()),
            events,
        }
    }

    pub fn config(&self) -> &ConflictConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConflictEvent> {
        self.events.subscribe()
    }

    /// Compare two snapshots of a record.
    ///
    /// Returns None when no monitored field differs. Otherwise records a
    /// pending conflict and auto-resolves it when enabled. A pending conflict
    /// already recorded for the same record is marked `Superseded` and kept
    /// until cleanup. The returned conflict reflects the
    /// outcome of auto-resolution.
    pub async fn detect(&self, collection: &str, local: &Record, remote: Option<&Record>) -> Option<Conflict> {
        let divergence = ConflictDetector::inspect(local, remote, &self.config.rules)?;

        let conflict = Conflict {
            id: uuid::Uuid::new_v4().to_string(),
            collection: collection.to_string(),
            record_id: record_id(local)
                .or_else(|| remote.and_then(record_id))
                .unwrap_or_default(),
            kind: divergence.kind,
            local_snapshot: local.clone(),
            remote_snapshot: remote.cloned(),
            conflicting_fields: divergence.fields,
            priority: divergence.priority,
            status: ConflictStatus::Pending,
            detected_at: Utc::now(),
            resolved_at: None,
            resolution: None,
            superseded_by: None,
        };

        let superseded: Vec<String> = {
            let mut conflicts = self.conflicts.lock().await;
            let now = Utc::now();
            let mut superseded = Vec::new();
            for c in conflicts.iter_mut().filter(|c| {
                c.is_pending() && c.collection == conflict.collection && c.record_id == conflict.record_id
            }) {
                c.status = ConflictStatus::Superseded;
                c.resolved_at = Some(now);
                c.superseded_by = Some(conflict.id.clone());
                superseded.push(c.id.clone());
            }
            conflicts.push(conflict.clone());
            self.persist(&conflicts).await;
            superseded
        };

        for id in superseded {
            tracing::debug!("conflict {} superseded by {}", id, conflict.id);
            let _ = self.events.send(ConflictEvent::Superseded {
                id,
                by: conflict.id.clone(),
            });
        }

        tracing::info!(
            "conflict detected on {}/{}: {} ({:?}, fields={:?})",
            conflict.collection,
            conflict.record_id,
            conflict.kind,
            conflict.priority,
            conflict.conflicting_fields
        );
        let _ = self.events.send(ConflictEvent::Detected(conflict.clone()));

        if self.config.auto_resolve {
            self.auto_resolve(&conflict.id).await;
            return self.get(&conflict.id).await;
        }
        Some(conflict)
    }

    /// Resolve one conflict and commit the chosen record to the remote.
    ///
    /// The conflict is marked resolved only after the commit succeeds; on
    /// failure it stays pending and the error is returned. Only one
    /// resolution of a conflict commits at a time; a concurrent call fails
    /// with `InProgress` before touching the remote.
    pub async fn resolve(&self, id: &str, strategy: &ResolutionStrategy) -> Result<Resolution, ConflictError> {
        let (conflict, _claim) = {
            let conflicts = self.conflicts.lock().await;
            let conflict = conflicts
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| ConflictError::NotFound(id.to_string()))?;
            if let Some(error) = closed_error(&conflict) {
                return Err(error);
            }
            let claim = InFlight::claim(&self.in_flight, id)
                .ok_or_else(|| ConflictError::InProgress(id.to_string()))?;
            (conflict, claim)
        };

        let resolution = ConflictResolver::resolve(
            strategy,
            &conflict.local_snapshot,
            conflict.remote_snapshot.as_ref(),
            &conflict.conflicting_fields,
            &self.config.rules.timestamp_field,
        );

        let outcome = match resolution {
            Resolution::Keep(record) => match self.commit(&conflict.collection, record).await {
                Ok(committed) => Resolution::Keep(committed),
                Err(e) => {
                    let error = ConflictError::CommitFailed(e);
                    tracing::warn!("resolution of conflict {} failed: {}", id, error);
                    let _ = self.events.send(ConflictEvent::ResolutionFailed {
                        id: id.to_string(),
                        error: error.clone(),
                    });
                    return Err(error);
                }
            },
            // already gone remotely
            Resolution::Delete => Resolution::Delete,
        };

        let resolved = {
            let mut conflicts = self.conflicts.lock().await;
            let Some(entry) = conflicts.iter_mut().find(|c| c.id == id) else {
                return Err(ConflictError::NotFound(id.to_string()));
            };
            if let Some(error) = closed_error(entry) {
                tracing::warn!("conflict {} closed while its resolution committed: {}", id, error);
                return Err(error);
            }
            entry.status = ConflictStatus::Resolved;
            entry.resolved_at = Some(Utc::now());
            entry.resolution = Some(strategy.name().to_string());
            let resolved = entry.clone();
            self.persist(&conflicts).await;
            resolved
        };

        tracing::info!(
            "conflict {} on {}/{} resolved with {}",
            resolved.id,
            resolved.collection,
            resolved.record_id,
            strategy
        );
        let _ = self.events.send(ConflictEvent::Resolved(resolved));
        Ok(outcome)
    }

    /// Resolve every pending conflict with one strategy. Returns how many succeeded.
    pub async fn resolve_all(&self, strategy: &ResolutionStrategy) -> usize {
        let ids: Vec<String> = self.pending().await.into_iter().map(|c| c.id).collect();
        let mut resolved = 0;
        for id in ids {
            if self.resolve(&id, strategy).await.is_ok() {
                resolved += 1;
            }
        }
        resolved
    }

    pub async fn get(&self, id: &str) -> Option<Conflict> {
        self.conflicts.lock().await.iter().find(|c| c.id == id).cloned()
    }

    /// Conflicts in detection order, optionally filtered by status.
    pub async fn list(&self, status: Option<ConflictStatus>) -> Vec<Conflict> {
        self.conflicts
            .lock()
            .await
            .iter()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect()
    }

    pub async fn pending(&self) -> Vec<Conflict> {
        self.list(Some(ConflictStatus::Pending)).await
    }

    pub async fn stats(&self) -> ConflictStats {
        let conflicts = self.conflicts.lock().await;
        let mut stats = ConflictStats {
            total: conflicts.len(),
            ..Default::default()
        };

        for c in conflicts.iter() {
            match c.status {
                ConflictStatus::Pending => stats.pending += 1,
                ConflictStatus::Resolved => stats.resolved += 1,
                ConflictStatus::Superseded => stats.superseded += 1,
            }
            *stats.by_kind.entry(c.kind).or_default() += 1;
            *stats.by_priority.entry(c.priority).or_default() += 1;
        }

        let auto = self.auto.lock();
        stats.auto_resolved = auto.resolved;
        stats.auto_resolution_paused = auto.paused;
        stats
    }

    /// Purge pending conflicts older than `max_age` and closed ones (resolved
    /// or superseded) closed longer than `retention` ago. Returns how many were removed.
    pub async fn cleanup(&self, max_age: Duration, retention: Duration) -> usize {
        let now = Utc::now();
        let mut conflicts = self.conflicts.lock().await;
        let before = conflicts.len();

        conflicts.retain(|c| match (c.status, c.resolved_at) {
            (ConflictStatus::Pending, _) => !older_than(now, c.detected_at, max_age),
            (_, Some(at)) => !older_than(now, at, retention),
            (_, None) => !older_than(now, c.detected_at, retention),
        });

        let removed = before - conflicts.len();
        if removed > 0 {
            self.persist(&conflicts).await;
            tracing::info!("conflict cleanup removed {} entries", removed);
        }
        removed
    }

    /// `cleanup` with the configured thresholds.
    pub async fn cleanup_expired(&self) -> usize {
        self.cleanup(self.config.max_age, self.config.retention).await
    }

    /// Remove every recorded conflict. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut conflicts = self.conflicts.lock().await;
        let removed = conflicts.len();
        conflicts.clear();
        self.persist(&conflicts).await;
        removed
    }

    /// Re-arm auto-resolution after it was paused or hit its budget.
    pub fn reset_auto_resolution(&self) {
        *self.auto.lock() = AutoResolution::default();
        tracing::info!("auto-resolution re-armed");
    }

    pub fn is_auto_resolution_paused(&self) -> bool {
        self.auto.lock().paused
    }

    /// Replace in-memory conflicts with the persisted set. Corrupt data is an empty set.
    pub async fn reload(&self) -> usize {
        let raw = match self.kv.get(CONFLICT_NAMESPACE, CONFLICT_KEY).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("failed to read persisted conflicts: {}", e);
                None
            }
        };

        let loaded: Vec<Conflict> = match raw.as_deref().map(serde_json::from_str::<Vec<serde_json::Value>>) {
            Some(Ok(values)) => values
                .into_iter()
                .filter_map(|v| match serde_json::from_value(v) {
                    Ok(c) => Some(c),
                    Err(e) => {
                        tracing::warn!("skipping malformed conflict: {}", e);
                        None
                    }
                })
                .collect(),
            Some(Err(e)) => {
                tracing::warn!("persisted conflicts are malformed, starting empty: {}", e);
                Vec::new()
            }
            None => Vec::new(),
        };

        let size = loaded.len();
        *self.conflicts.lock().await = loaded;
        size
    }

    async fn auto_resolve(&self, id: &str) {
        {
            let auto = self.auto.lock();
            if auto.paused {
                tracing::debug!("auto-resolution paused; conflict {} left pending", id);
                return;
            }
            if auto.resolved >= self.config.max_auto_resolutions {
                tracing::debug!("auto-resolution budget exhausted; conflict {} left pending", id);
                return;
            }
        }

        match self.resolve(id, &self.config.default_strategy).await {
            Ok(_) => {
                let mut auto = self.auto.lock();
                auto.resolved += 1;
                auto.consecutive_failures = 0;
            }
            Err(ConflictError::CommitFailed(_)) => {
                let paused_at = {
                    let mut auto = self.auto.lock();
                    auto.consecutive_failures += 1;
                    if auto.consecutive_failures >= self.config.max_consecutive_failures && !auto.paused {
                        auto.paused = true;
                        Some(auto.consecutive_failures)
                    } else {
                        None
                    }
                };
                if let Some(consecutive_failures) = paused_at {
                    tracing::warn!(
                        "auto-resolution paused after {} consecutive failures",
                        consecutive_failures
                    );
                    let _ = self
                        .events
                        .send(ConflictEvent::AutoResolutionPaused { consecutive_failures });
                }
            }
            Err(e) => tracing::debug!("auto-resolution skipped conflict {}: {}", id, e),
        }
    }

    async fn commit(&self, collection: &str, record: Record) -> Result<Record, RemoteError> {
        let timeout = self.config.remote_timeout;
        tokio::time::timeout(timeout, self.remote.upsert(collection, record))
            .await
            .map_err(|_| RemoteError::Timeout(timeout))?
    }

    async fn persist(&self, conflicts: &[Conflict]) {
        let blob = match serde_json::to_string(conflicts) {
            Ok(blob) => blob,
            Err(e) => {
                tracing::error!("failed to serialize conflicts: {}", e);
                return;
            }
        };
        if let Err(e) = self.kv.set(CONFLICT_NAMESPACE, CONFLICT_KEY, blob).await {
            tracing::warn!("conflict persistence degraded: {}", e);
        }
    }
}

/// Error for a conflict that can no longer be resolved.
fn closed_error(conflict: &Conflict) -> Option<ConflictError> {
    match conflict.status {
        ConflictStatus::Pending => None,
        ConflictStatus::Resolved => Some(ConflictError::AlreadyResolved(conflict.id.clone())),
        ConflictStatus::Superseded => Some(ConflictError::Superseded {
            id: conflict.id.clone(),
            by: conflict.superseded_by.clone().unwrap_or_default(),
        }),
    }
}

/// Claim on a conflict's resolution, released on drop.
struct InFlight<'a> {
    set: &'a SyncMutex<HashSet<String>>,
    id: String,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a SyncMutex<HashSet<String>>, id: &str) -> Option<Self> {
        set.lock().insert(id.to_string()).then(|| Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

fn older_than(now: DateTime<Utc>, at: DateTime<Utc>, threshold: Duration) -> bool {
    (now - at).to_std().map_or(false, |age| age > threshold)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::{DashMapKeyValueStore, DashMapRemoteStore};
    use crate::domain::value_objects::FieldRule;
    use serde_json::{json, Value};
    use tokio_test::assert_ok;

    fn record(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn engine(config: ConflictConfig) -> (ConflictEngine, DashMapKeyValueStore, DashMapRemoteStore) {
        let kv = DashMapKeyValueStore::new();
        let remote = DashMapRemoteStore::new();
        let engine = ConflictEngine::new(Arc::new(kv.clone()), Arc::new(remote.clone()), config);
        (engine, kv, remote)
    }

    // ===== Detection Tests =====

    #[tokio::test]
    async fn test_no_conflict_for_equal_monitored_fields() {
        let (engine, _, _) = engine(ConflictConfig::default());
        let local = record(json!({"id": "r1", "name": "A", "updated_at": "2024-01-01T10:00:00Z"}));
        let remote = record(json!({"id": "r1", "name": "A", "updated_at": "2024-01-01T12:00:00Z"}));

        assert!(engine.detect("products", &local, Some(&remote)).await.is_none());
        assert_eq!(engine.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_detect_records_pending_conflict() {
        let (engine, kv, _) = engine(ConflictConfig::default());
        let mut events = engine.subscribe();
        let local = record(json!({"id": "r1", "name": "A", "price": 10}));
        let remote = record(json!({"id": "r1", "name": "B", "price": 10}));

        let conflict = engine.detect("products", &local, Some(&remote)).await.unwrap();
        assert_eq!(conflict.record_id, "r1");
        assert_eq!(conflict.conflicting_fields, vec!["name"]);
        assert_eq!(conflict.status, ConflictStatus::Pending);
        assert!(matches!(events.recv().await.unwrap(), ConflictEvent::Detected(_)));

        let blob = kv.get(CONFLICT_NAMESPACE, CONFLICT_KEY).await.unwrap().unwrap();
        assert!(blob.contains("\"recordId\":\"r1\""));
    }

    #[tokio::test]
    async fn test_redetection_supersedes_pending_conflict() {
        let (engine, _, remote) = engine(ConflictConfig::default());
        let mut events = engine.subscribe();
        let local = record(json!({"id": "r1", "name": "A"}));
        let first = engine
            .detect("products", &local, Some(&record(json!({"id": "r1", "name": "B"}))))
            .await
            .unwrap();
        let second = engine
            .detect("products", &local, Some(&record(json!({"id": "r1", "name": "C"}))))
            .await
            .unwrap();

        let pending = engine.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);

        let earlier = engine.get(&first.id).await.unwrap();
        assert_eq!(earlier.status, ConflictStatus::Superseded);
        assert_eq!(earlier.superseded_by.as_deref(), Some(second.id.as_str()));
        assert!(earlier.resolved_at.is_some());

        let stats = engine.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.superseded, 1);

        assert!(matches!(events.recv().await.unwrap(), ConflictEvent::Detected(_)));
        assert!(matches!(
            events.recv().await.unwrap(),
            ConflictEvent::Superseded { id, by } if id == first.id && by == second.id
        ));

        assert_eq!(
            engine.resolve(&first.id, &ResolutionStrategy::LocalWins).await,
            Err(ConflictError::Superseded {
                id: first.id.clone(),
                by: second.id.clone()
            })
        );
        assert!(remote.dispatches().is_empty());

        // kept until cleanup purges it
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.cleanup(Duration::from_secs(60), Duration::from_millis(5)).await, 1);
        assert_eq!(engine.list(None).await, vec![engine.get(&second.id).await.unwrap()]);
    }

    #[tokio::test]
    async fn test_delete_conflict_when_remote_missing() {
        let (engine, _, _) = engine(ConflictConfig::default());
        let local = record(json!({"id": "r1", "name": "A"}));
        let conflict = engine.detect("products", &local, None).await.unwrap();
        assert_eq!(conflict.kind, ConflictKind::DeleteConflict);
    }

    // ===== Resolution Tests =====

    #[tokio::test]
    async fn test_timestamp_wins_commits_newer_local() {
        let (engine, _, remote) = engine(ConflictConfig::default());
        let local = record(json!({"id": "r1", "name": "A", "updated_at": "2024-01-02T00:00:00Z"}));
        let server = record(json!({"id": "r1", "name": "B", "updated_at": "2024-01-01T00:00:00Z"}));

        let conflict = engine.detect("products", &local, Some(&server)).await.unwrap();
        let outcome = engine
            .resolve(&conflict.id, &ResolutionStrategy::TimestampWins)
            .await
            .unwrap();

        assert_eq!(outcome, Resolution::Keep(local.clone()));
        assert_eq!(remote.record("products", "r1"), Some(local));

        let resolved = engine.get(&conflict.id).await.unwrap();
        assert!(resolved.is_resolved());
        assert_eq!(resolved.resolution.as_deref(), Some("timestamp_wins"));
        assert!(resolved.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_field_level_resolution_commits_mixed_record() {
        let (engine, _, remote) = engine(ConflictConfig::default());
        let local = record(json!({"id": "r1", "name": "A", "price": 10}));
        let server = record(json!({"id": "r1", "name": "B", "price": 20}));
        let conflict = engine.detect("products", &local, Some(&server)).await.unwrap();

        let strategy = ResolutionStrategy::field_level([
            ("name", FieldRule::ClientWins),
            ("price", FieldRule::ServerWins),
        ]);
        engine.resolve(&conflict.id, &strategy).await.unwrap();

        assert_eq!(
            remote.record("products", "r1"),
            Some(record(json!({"id": "r1", "name": "A", "price": 20})))
        );
    }

    #[tokio::test]
    async fn test_commit_failure_leaves_conflict_pending() {
        let (engine, _, remote) = engine(ConflictConfig::default());
        let local = record(json!({"id": "r1", "name": "A"}));
        let server = record(json!({"id": "r1", "name": "B"}));
        let conflict = engine.detect("products", &local, Some(&server)).await.unwrap();

        remote.set_reachable(false);
        let err = engine
            .resolve(&conflict.id, &ResolutionStrategy::LocalWins)
            .await
            .unwrap_err();
        assert!(matches!(err, ConflictError::CommitFailed(RemoteError::Network(_))));
        assert_eq!(engine.get(&conflict.id).await.unwrap().status, ConflictStatus::Pending);

        remote.set_reachable(true);
        engine.resolve(&conflict.id, &ResolutionStrategy::LocalWins).await.unwrap();
        assert_eq!(
            engine.resolve(&conflict.id, &ResolutionStrategy::LocalWins).await,
            Err(ConflictError::AlreadyResolved(conflict.id.clone()))
        );
    }

    #[tokio::test]
    async fn test_concurrent_resolve_commits_once() {
        let (engine, _, remote) = engine(ConflictConfig::default());
        let local = record(json!({"id": "r1", "name": "A"}));
        let server = record(json!({"id": "r1", "name": "B"}));
        let conflict = engine.detect("products", &local, Some(&server)).await.unwrap();

        remote.set_latency(Duration::from_millis(20));
        let (a, b) = tokio::join!(
            engine.resolve(&conflict.id, &ResolutionStrategy::LocalWins),
            engine.resolve(&conflict.id, &ResolutionStrategy::RemoteWins),
        );

        assert_ok!(a);
        assert_eq!(b, Err(ConflictError::InProgress(conflict.id.clone())));
        assert_eq!(remote.dispatches().len(), 1);
        assert_eq!(remote.record("products", "r1"), Some(local));

        // the claim is released once the winner finishes
        assert_eq!(
            engine.resolve(&conflict.id, &ResolutionStrategy::LocalWins).await,
            Err(ConflictError::AlreadyResolved(conflict.id.clone()))
        );
    }

    #[tokio::test]
    async fn test_remote_wins_on_deleted_record_commits_nothing() {
        let (engine, _, remote) = engine(ConflictConfig::default());
        let local = record(json!({"id": "r1", "name": "A"}));
        let conflict = engine.detect("products", &local, None).await.unwrap();

        let outcome = engine
            .resolve(&conflict.id, &ResolutionStrategy::RemoteWins)
            .await
            .unwrap();
        assert_eq!(outcome, Resolution::Delete);
        assert!(remote.dispatches().is_empty());
        assert!(engine.get(&conflict.id).await.unwrap().is_resolved());
    }

    #[tokio::test]
    async fn test_resolve_unknown_conflict() {
        let (engine, _, _) = engine(ConflictConfig::default());
        assert_eq!(
            engine.resolve("missing", &ResolutionStrategy::Merge).await,
            Err(ConflictError::NotFound("missing".to_string()))
        );
    }

    #[tokio::test]
    async fn test_resolve_all() {
        let (engine, _, _) = engine(ConflictConfig::default());
        for i in 0..3 {
            let local = record(json!({"id": i, "name": "A"}));
            let server = record(json!({"id": i, "name": "B"}));
            engine.detect("products", &local, Some(&server)).await.unwrap();
        }

        assert_eq!(engine.resolve_all(&ResolutionStrategy::Merge).await, 3);
        let stats = engine.stats().await;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.resolved, 3);
        assert_eq!(stats.by_kind.get(&ConflictKind::FieldLevel), Some(&3));
    }

    // ===== Auto-resolution Tests =====

    #[tokio::test]
    async fn test_auto_resolution_resolves_on_detect() {
        let (engine, _, remote) = engine(ConflictConfig::new().auto_resolve(ResolutionStrategy::LocalWins));
        let local = record(json!({"id": "r1", "name": "A"}));
        let server = record(json!({"id": "r1", "name": "B"}));

        let conflict = engine.detect("products", &local, Some(&server)).await.unwrap();
        assert!(conflict.is_resolved());
        assert_eq!(remote.record("products", "r1"), Some(local));
        assert_eq!(engine.stats().await.auto_resolved, 1);
    }

    #[tokio::test]
    async fn test_auto_resolution_budget() {
        let (engine, _, _) = engine(
            ConflictConfig::new()
                .auto_resolve(ResolutionStrategy::LocalWins)
                .max_auto_resolutions(1),
        );
        let a = engine
            .detect("t", &record(json!({"id": "a", "v": 1})), Some(&record(json!({"id": "a", "v": 2}))))
            .await
            .unwrap();
        let b = engine
            .detect("t", &record(json!({"id": "b", "v": 1})), Some(&record(json!({"id": "b", "v": 2}))))
            .await
            .unwrap();

        assert!(a.is_resolved());
        assert!(!b.is_resolved());
    }

    #[tokio::test]
    async fn test_auto_resolution_pauses_after_failures() {
        let (engine, _, remote) = engine(
            ConflictConfig::new()
                .auto_resolve(ResolutionStrategy::LocalWins)
                .max_consecutive_failures(2),
        );
        let mut events = engine.subscribe();
        remote.set_reachable(false);

        for id in ["a", "b", "c"] {
            engine
                .detect("t", &record(json!({"id": id, "v": 1})), Some(&record(json!({"id": id, "v": 2}))))
                .await
                .unwrap();
        }

        assert!(engine.is_auto_resolution_paused());
        assert_eq!(engine.pending().await.len(), 3);

        let mut paused = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ConflictEvent::AutoResolutionPaused { consecutive_failures: 2 }) {
                paused += 1;
            }
        }
        assert_eq!(paused, 1);

        remote.set_reachable(true);
        engine.reset_auto_resolution();
        assert!(!engine.is_auto_resolution_paused());
        let d = engine
            .detect("t", &record(json!({"id": "d", "v": 1})), Some(&record(json!({"id": "d", "v": 2}))))
            .await
            .unwrap();
        assert!(d.is_resolved());
    }

    // ===== Cleanup and Persistence Tests =====

    #[tokio::test]
    async fn test_cleanup_by_age_and_retention() {
        let (engine, _, _) = engine(ConflictConfig::default());
        let pending = engine
            .detect("t", &record(json!({"id": "a", "v": 1})), Some(&record(json!({"id": "a", "v": 2}))))
            .await
            .unwrap();
        let resolved = engine
            .detect("t", &record(json!({"id": "b", "v": 1})), Some(&record(json!({"id": "b", "v": 2}))))
            .await
            .unwrap();
        engine.resolve(&resolved.id, &ResolutionStrategy::LocalWins).await.unwrap();

        // nothing is old yet
        assert_eq!(engine.cleanup(Duration::from_secs(60), Duration::from_secs(60)).await, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.cleanup(Duration::from_secs(60), Duration::from_millis(5)).await, 1);
        assert_eq!(engine.list(None).await, vec![engine.get(&pending.id).await.unwrap()]);

        assert_eq!(engine.cleanup(Duration::from_millis(5), Duration::from_secs(60)).await, 1);
        assert_eq!(engine.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_reload_and_corrupt_blob() {
        let (engine, kv, remote) = engine(ConflictConfig::default());
        engine
            .detect("t", &record(json!({"id": "a", "v": 1})), Some(&record(json!({"id": "a", "v": 2}))))
            .await
            .unwrap();

        let other = ConflictEngine::new(Arc::new(kv.clone()), Arc::new(remote), ConflictConfig::default());
        assert_eq!(other.reload().await, 1);

        kv.set(CONFLICT_NAMESPACE, CONFLICT_KEY, "not json".to_string())
            .await
            .unwrap();
        assert_eq!(other.reload().await, 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let (engine, _, _) = engine(ConflictConfig::default());
        engine
            .detect("t", &record(json!({"id": "a", "v": 1})), Some(&record(json!({"id": "a", "v": 2}))))
            .await
            .unwrap();
        assert_eq!(engine.clear().await, 1);
        assert!(engine.list(None).await.is_empty());
    }
}
