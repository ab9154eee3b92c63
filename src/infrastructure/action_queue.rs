//! Action Queue
//!
//! Persistent, priority-ordered queue of mutations waiting to reach the
//! remote store.
//!
//! Every mutation of the queue is a single read-modify-persist step under
//! one lock, and the whole queue is mirrored as a JSON array under a fixed
//! key. Processing passes dispatch sequentially, high priority first and
//! oldest first within a priority, in bounded batches. Failures back off
//! exponentially and are dropped (with a notification) once they run out
//! of attempts.

use crate::domain::entities::{
    ActionKind, ActionPriority, ActionStatus, NewAction, QueuedAction, StorageChange,
};
use crate::domain::ports::{ConnectivitySource, KeyValueStore, RemoteStore};
use crate::domain::value_objects::{Record, Selector};
use crate::error::{ConfigError, QueueError, RemoteError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Interval;

/// Namespace holding the persisted queue.
pub const QUEUE_NAMESPACE: &str = "sync";
/// Key holding the persisted queue.
pub const QUEUE_KEY: &str = "offline_queue";

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum actions dispatched per pass (default: 10)
    pub batch_size: usize,
    /// Attempts before an action is dropped (default: 3)
    pub max_attempts: u32,
    /// First retry delay, doubled per attempt (default: 1s)
    pub base_delay: Duration,
    /// Upper bound of the retry delay (default: 5min)
    pub max_delay: Duration,
    /// Interval between drain passes while online (default: 30s)
    pub drain_interval: Duration,
    /// Timeout applied to every remote call (default: 10s)
    pub remote_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            drain_interval: Duration::from_secs(30),
            remote_timeout: Duration::from_secs(10),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the backoff bounds.
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    pub fn remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Delay before retrying an action that already failed `attempts` times.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::InvalidBackoff);
        }
        if self.drain_interval.is_zero() {
            return Err(ConfigError::InvalidInterval("drain_interval"));
        }
        if self.remote_timeout.is_zero() {
            return Err(ConfigError::InvalidInterval("remote_timeout"));
        }
        Ok(())
    }
}

/// Conjunctive filter over queued actions. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionFilter {
    pub status: Option<ActionStatus>,
    pub target: Option<String>,
    pub kind: Option<ActionKind>,
    pub priority: Option<ActionPriority>,
}

impl ActionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ActionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn kind(mut self, kind: ActionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn priority(mut self, priority: ActionPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn matches(&self, action: &QueuedAction) -> bool {
        self.status.map_or(true, |s| action.status == s)
            && self.target.as_ref().map_or(true, |t| &action.target == t)
            && self.kind.map_or(true, |k| action.kind == k)
            && self.priority.map_or(true, |p| action.priority == p)
    }
}

/// Processing statistics since the queue was created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub total_processed: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub average_processing_time: Duration,
}

/// Outcome of one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dropped: usize,
}

/// Queue lifecycle notifications.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued(QueuedAction),
    Dispatched { id: String, attempt: u32 },
    /// The remote accepted the action; `response` is the authoritative data
    Succeeded { action: QueuedAction, response: Vec<Record> },
    Failed { action: QueuedAction, error: RemoteError },
    /// The action ran out of attempts and was removed
    TerminalFailure { action: QueuedAction, error: RemoteError },
    Cleared { removed: usize },
    Reloaded { size: usize },
}

/// Callback invoked once per action dropped after its last attempt.
pub type TerminalFailureHook = Arc<dyn Fn(&QueuedAction, &RemoteError) + Send + Sync>;

/// Persisted element shape. Older records may lack priority or status.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedAction {
    id: String,
    #[serde(alias = "type")]
    kind: ActionKind,
    #[serde(alias = "table")]
    target: String,
    #[serde(default, alias = "data")]
    payload: Option<Record>,
    #[serde(default)]
    selector: Option<Selector>,
    #[serde(default)]
    priority: Option<ActionPriority>,
    #[serde(default)]
    status: Option<ActionStatus>,
    #[serde(default)]
    attempts: u32,
    #[serde(default)]
    max_attempts: Option<u32>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    retry_at: Option<DateTime<Utc>>,
}

impl PersistedAction {
    fn into_action(self, default_max_attempts: u32) -> QueuedAction {
        let status = match self.status.unwrap_or_default() {
            // a pass was interrupted; dispatch again
            ActionStatus::Processing => ActionStatus::Pending,
            other => other,
        };
        QueuedAction {
            priority: self.priority.unwrap_or_else(|| self.kind.default_priority()),
            id: self.id,
            kind: self.kind,
            target: self.target,
            payload: self.payload,
            selector: self.selector,
            status,
            attempts: self.attempts,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts),
            created_at: self.created_at,
            last_attempt_at: self.last_attempt_at,
            last_error: self.last_error,
            retry_at: self.retry_at,
        }
    }
}

#[derive(Default)]
struct QueueState {
    actions: Vec<QueuedAction>,
    /// Last blob this instance wrote or loaded
    persisted: Option<String>,
}

#[derive(Default)]
struct StatsAccumulator {
    total_processed: u64,
    success_count: u64,
    error_count: u64,
    total_time: Duration,
}

/// Resets the processing flag when a pass ends, however it ends.
struct PassFlag<'a>(&'a AtomicBool);

impl Drop for PassFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Persistent action queue.
pub struct ActionQueue {
    kv: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn ConnectivitySource>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    processing: AtomicBool,
    stats: SyncMutex<StatsAccumulator>,
    last_error: RwLock<Option<String>>,
    events: broadcast::Sender<QueueEvent>,
    on_terminal_failure: RwLock<Option<TerminalFailureHook>>,
}

impl ActionQueue {
    /// Create an empty queue. Call `reload` to pick up persisted actions.
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn ConnectivitySource>,
        config: QueueConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            kv,
            remote,
            connectivity,
            config,
            state: Mutex::new(QueueState::default()),
            processing: AtomicBool::new(false),
            stats: SyncMutex::new(StatsAccumulator::default()),
            last_error: RwLock::new(None),
            events,
            on_terminal_failure: RwLock::new(None),
        }
    }

    /// Set a callback invoked when an action is dropped after its last attempt.
    pub fn on_terminal_failure<F>(self, hook: F) -> Self
    where
        F: Fn(&QueuedAction, &RemoteError) + Send + Sync + 'static,
    {
        self.set_terminal_failure_hook(Arc::new(hook));
        self
    }

    /// Replace the terminal-failure callback on a shared queue.
    pub fn set_terminal_failure_hook(&self, hook: TerminalFailureHook) {
        *self.on_terminal_failure.write() = Some(hook);
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Add a mutation. Returns the id of the queued action.
    pub async fn enqueue(&self, request: NewAction) -> Result<String, QueueError> {
        if request.target.is_empty() {
            return Err(QueueError::MissingTarget);
        }
        match request.kind {
            ActionKind::Insert | ActionKind::Upsert if request.payload.is_none() => {
                return Err(QueueError::MissingPayload(request.kind));
            }
            ActionKind::Update if request.payload.is_none() => {
                return Err(QueueError::MissingPayload(request.kind));
            }
            ActionKind::Update | ActionKind::Delete if request.selector.is_none() => {
                return Err(QueueError::MissingSelector(request.kind));
            }
            _ => {}
        }

        let action = QueuedAction {
            id: uuid::Uuid::new_v4().to_string(),
            priority: request
                .priority
                .unwrap_or_else(|| request.kind.default_priority()),
            kind: request.kind,
            target: request.target,
            payload: request.payload,
            selector: request.selector,
            status: ActionStatus::Pending,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(self.config.max_attempts),
            created_at: Utc::now(),
            last_attempt_at: None,
            last_error: None,
            retry_at: None,
        };

        {
            let mut state = self.state.lock().await;
            state.actions.push(action.clone());
            self.persist(&mut state).await;
        }

        tracing::debug!(
            "queued {} on {} (id={}, priority={:?})",
            action.kind,
            action.target,
            action.id,
            action.priority
        );
        let id = action.id.clone();
        let _ = self.events.send(QueueEvent::Enqueued(action));
        Ok(id)
    }

    /// Run one processing pass.
    ///
    /// No-op while offline or while another pass is running. Due pending
    /// actions are dispatched one at a time, high priority first and oldest
    /// first within a priority, at most `batch_size` per pass.
    pub async fn process(&self) -> PassSummary {
        let mut summary = PassSummary::default();

        if !self.connectivity.is_online() {
            tracing::debug!("queue pass skipped: offline");
            return summary;
        }
        if self.processing.swap(true, Ordering::SeqCst) {
            tracing::debug!("queue pass skipped: already processing");
            return summary;
        }
        let _flag = PassFlag(&self.processing);

        let batch = self.select_batch().await;
        if batch.is_empty() {
            return summary;
        }
        tracing::info!("queue pass started: {} actions", batch.len());

        for (idx, id) in batch.iter().enumerate() {
            if !self.connectivity.is_online() {
                tracing::info!("went offline mid-pass; {} actions deferred", batch.len() - idx);
                self.release(&batch[idx..]).await;
                break;
            }

            let Some(action) = self.get(id).await else {
                continue;
            };

            summary.dispatched += 1;
            let _ = self.events.send(QueueEvent::Dispatched {
                id: action.id.clone(),
                attempt: action.attempts + 1,
            });

            let started = Instant::now();
            let result = self.dispatch(&action).await;
            self.record_timing(started.elapsed(), result.is_ok());

            match result {
                Ok(response) => {
                    summary.succeeded += 1;
                    self.complete(action, response).await;
                }
                Err(error) => {
                    if self.fail(action, error).await {
                        summary.dropped += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
            }
        }

        tracing::info!(
            "queue pass finished: dispatched={} succeeded={} failed={} dropped={}",
            summary.dispatched,
            summary.succeeded,
            summary.failed,
            summary.dropped
        );
        summary
    }

    /// Reset failed actions to pending, each with its own backoff deadline.
    ///
    /// Returns how many actions were rescheduled. Actions become due once
    /// their deadline passes; `retry_failed` waits for them.
    pub async fn schedule_retries(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut count = 0;

        for action in state
            .actions
            .iter_mut()
            .filter(|a| a.status == ActionStatus::Failed)
        {
            let delay = self.config.backoff_delay(action.attempts);
            action.status = ActionStatus::Pending;
            action.retry_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            count += 1;
        }

        if count > 0 {
            self.persist(&mut state).await;
            tracing::debug!("rescheduled {} failed actions", count);
        }
        count
    }

    /// Retry every failed action after its backoff delay.
    ///
    /// Each action waits `base_delay * 2^attempts` (capped), so actions
    /// that failed more often wait longer. Processing runs once per
    /// distinct deadline, earliest first.
    pub async fn retry_failed(&self) {
        if self.schedule_retries().await == 0 {
            return;
        }

        let deadlines: BTreeSet<DateTime<Utc>> = {
            let state = self.state.lock().await;
            state
                .actions
                .iter()
                .filter(|a| a.status == ActionStatus::Pending)
                .filter_map(|a| a.retry_at)
                .collect()
        };

        let started = Instant::now();
        let origin = Utc::now();
        for deadline in deadlines {
            let offset = (deadline - origin).to_std().unwrap_or_default();
            tokio::time::sleep(offset.saturating_sub(started.elapsed())).await;

            {
                let mut state = self.state.lock().await;
                for action in state
                    .actions
                    .iter_mut()
                    .filter(|a| a.status == ActionStatus::Pending && a.retry_at == Some(deadline))
                {
                    action.retry_at = None;
                }
                self.persist(&mut state).await;
            }
            self.process().await;
        }
    }

    /// Remove actions matching the filter, or every action. Returns how many were removed.
    pub async fn clear(&self, filter: Option<ActionFilter>) -> usize {
        let removed = {
            let mut state = self.state.lock().await;
            let before = state.actions.len();
            match &filter {
                Some(f) => state.actions.retain(|a| !f.matches(a)),
                None => state.actions.clear(),
            }
            let removed = before - state.actions.len();
            if removed > 0 {
                self.persist(&mut state).await;
            }
            removed
        };

        tracing::info!("cleared {} queued actions", removed);
        let _ = self.events.send(QueueEvent::Cleared { removed });
        removed
    }

    /// Remove one action. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let before = state.actions.len();
        state.actions.retain(|a| a.id != id);
        let removed = state.actions.len() != before;
        if removed {
            self.persist(&mut state).await;
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<QueuedAction> {
        self.state
            .lock()
            .await
            .actions
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    /// Every queued action in queue order.
    pub async fn all(&self) -> Vec<QueuedAction> {
        self.state.lock().await.actions.clone()
    }

    /// Actions matching a filter, in queue order.
    pub async fn filter(&self, filter: &ActionFilter) -> Vec<QueuedAction> {
        self.state
            .lock()
            .await
            .actions
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect()
    }

    pub async fn by_status(&self, status: ActionStatus) -> Vec<QueuedAction> {
        self.filter(&ActionFilter::new().status(status)).await
    }

    pub async fn by_table(&self, target: &str) -> Vec<QueuedAction> {
        self.filter(&ActionFilter::new().target(target)).await
    }

    pub async fn by_kind(&self, kind: ActionKind) -> Vec<QueuedAction> {
        self.filter(&ActionFilter::new().kind(kind)).await
    }

    pub async fn by_priority(&self, priority: ActionPriority) -> Vec<QueuedAction> {
        self.filter(&ActionFilter::new().priority(priority)).await
    }

    /// Actions still owed to the remote for one collection, in queue order.
    pub async fn pending_for(&self, target: &str) -> Vec<QueuedAction> {
        self.state
            .lock()
            .await
            .actions
            .iter()
            .filter(|a| a.target == target && a.status != ActionStatus::Completed)
            .cloned()
            .collect()
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.actions.len()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        let acc = self.stats.lock();
        let average = if acc.total_processed > 0 {
            acc.total_time / acc.total_processed as u32
        } else {
            Duration::ZERO
        };
        QueueStats {
            total_processed: acc.total_processed,
            success_count: acc.success_count,
            error_count: acc.error_count,
            average_processing_time: average,
        }
    }

    /// Last persistence or dispatch error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Replace the in-memory queue with the persisted one.
    ///
    /// A missing or unparseable blob is an empty queue; unparseable
    /// elements are skipped. Returns the new size.
    pub async fn reload(&self) -> usize {
        let blob = match self.kv.get(QUEUE_NAMESPACE, QUEUE_KEY).await {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!("failed to read persisted queue: {}", e);
                *self.last_error.write() = Some(e.to_string());
                return self.size().await;
            }
        };

        let actions = blob
            .as_deref()
            .map(|raw| self.parse(raw))
            .unwrap_or_default();
        let size = actions.len();

        {
            let mut state = self.state.lock().await;
            state.actions = actions;
            state.persisted = blob;
        }

        tracing::debug!("queue reloaded: {} actions", size);
        let _ = self.events.send(QueueEvent::Reloaded { size });
        size
    }

    /// Start the background drain loop and the cross-instance reload watcher.
    ///
    /// While online the queue drains immediately and then every
    /// `drain_interval`; going offline cancels the interval; coming back
    /// online drains once before the interval resumes. Runs until shutdown.
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);

        tokio::spawn(async move {
            let mut connectivity = queue.connectivity.subscribe();
            let mut changes = queue.kv.subscribe();
            let mut changes_open = true;

            let mut online = connectivity.borrow_and_update().online;
            let mut ticker = None;
            if online {
                queue.drain().await;
                ticker = Some(queue.new_ticker());
            }

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::debug!("queue loop stopped");
                        break;
                    }
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            tracing::debug!("connectivity source dropped; queue loop stopped");
                            break;
                        }
                        let now_online = connectivity.borrow_and_update().online;
                        if now_online && !online {
                            tracing::info!("online: draining queue");
                            queue.drain().await;
                            ticker = Some(queue.new_ticker());
                        } else if !now_online && online {
                            tracing::info!("offline: queue draining paused");
                            ticker = None;
                        }
                        online = now_online;
                    }
                    _ = next_tick(&mut ticker) => {
                        queue.schedule_retries().await;
                        queue.drain().await;
                    }
                    change = changes.recv(), if changes_open => {
                        match change {
                            Ok(StorageChange { namespace, key })
                                if namespace == QUEUE_NAMESPACE
                                    && key.as_deref().map_or(true, |k| k == QUEUE_KEY) =>
                            {
                                queue.reload_if_changed().await;
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(_)) => {
                                queue.reload_if_changed().await;
                            }
                            Err(broadcast::error::RecvError::Closed) => changes_open = false,
                        }
                    }
                }
            }
        })
    }

    /// Run passes until nothing due is left. Returns the combined summary.
    pub async fn drain(&self) -> PassSummary {
        let mut total = PassSummary::default();
        while self.size().await > 0 {
            let pass = self.process().await;
            if pass.dispatched == 0 {
                break;
            }
            total.dispatched += pass.dispatched;
            total.succeeded += pass.succeeded;
            total.failed += pass.failed;
            total.dropped += pass.dropped;
        }
        total
    }

    fn new_ticker(&self) -> Interval {
        let period = self.config.drain_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker
    }

    /// Reload when another instance rewrote the persisted queue.
    async fn reload_if_changed(&self) {
        let blob = match self.kv.get(QUEUE_NAMESPACE, QUEUE_KEY).await {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!("failed to read persisted queue: {}", e);
                return;
            }
        };

        let unchanged = self.state.lock().await.persisted == blob;
        if !unchanged {
            tracing::info!("persisted queue changed externally; reloading");
            self.reload().await;
        }
    }

    fn parse(&self, raw: &str) -> Vec<QueuedAction> {
        let elements = match serde_json::from_str::<Vec<serde_json::Value>>(raw) {
            Ok(elements) => elements,
            Err(e) => {
                tracing::warn!("persisted queue is malformed, starting empty: {}", e);
                return Vec::new();
            }
        };

        elements
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<PersistedAction>(value) {
                Ok(action) => Some(action.into_action(self.config.max_attempts)),
                Err(e) => {
                    tracing::warn!("skipping malformed queued action: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Mirror the queue to durable storage.
    ///
    /// On failure the in-memory state stays authoritative and the error is
    /// exposed through `last_error`.
    async fn persist(&self, state: &mut QueueState) {
        let blob = match serde_json::to_string(&state.actions) {
            Ok(blob) => blob,
            Err(e) => {
                tracing::error!("failed to serialize queue: {}", e);
                *self.last_error.write() = Some(e.to_string());
                return;
            }
        };

        match self.kv.set(QUEUE_NAMESPACE, QUEUE_KEY, blob.clone()).await {
            Ok(()) => state.persisted = Some(blob),
            Err(e) => {
                tracing::warn!("queue persistence degraded: {}", e);
                *self.last_error.write() = Some(e.to_string());
            }
        }
    }

    /// Pick and mark the next batch.
    async fn select_batch(&self) -> Vec<String> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let mut due: Vec<&QueuedAction> = state.actions.iter().filter(|a| a.is_due(now)).collect();
        due.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        let batch: Vec<String> = due
            .into_iter()
            .take(self.config.batch_size)
            .map(|a| a.id.clone())
            .collect();

        if !batch.is_empty() {
            for action in state.actions.iter_mut().filter(|a| batch.contains(&a.id)) {
                action.status = ActionStatus::Processing;
                action.last_attempt_at = Some(now);
            }
            self.persist(&mut state).await;
        }
        batch
    }

    /// Return undispatched actions of an interrupted pass to pending.
    async fn release(&self, ids: &[String]) {
        let mut state = self.state.lock().await;
        for action in state.actions.iter_mut().filter(|a| ids.contains(&a.id)) {
            action.status = ActionStatus::Pending;
        }
        self.persist(&mut state).await;
    }

    async fn dispatch(&self, action: &QueuedAction) -> Result<Vec<Record>, RemoteError> {
        let timeout = self.config.remote_timeout;
        let call = async {
            let target = action.target.as_str();
            match action.kind {
                ActionKind::Insert => {
                    let record = action.payload.clone().unwrap_or_default();
                    self.remote.insert(target, record).await.map(|r| vec![r])
                }
                ActionKind::Upsert => {
                    let record = action.payload.clone().unwrap_or_default();
                    self.remote.upsert(target, record).await.map(|r| vec![r])
                }
                ActionKind::Update => {
                    let patch = action.payload.clone().unwrap_or_default();
                    let selector = action.selector.clone().unwrap_or_default();
                    self.remote.update(target, patch, &selector).await
                }
                ActionKind::Delete => {
                    let selector = action.selector.clone().unwrap_or_default();
                    self.remote.delete(target, &selector).await
                }
            }
        };

        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| RemoteError::Timeout(timeout))?
    }

    async fn complete(&self, action: QueuedAction, response: Vec<Record>) {
        {
            let mut state = self.state.lock().await;
            state.actions.retain(|a| a.id != action.id);
            self.persist(&mut state).await;
        }

        tracing::debug!("{} on {} succeeded (id={})", action.kind, action.target, action.id);
        let mut done = action;
        done.status = ActionStatus::Completed;
        let _ = self.events.send(QueueEvent::Succeeded {
            action: done,
            response,
        });
    }

    /// Record a failed attempt. Returns true when the action was dropped.
    async fn fail(&self, action: QueuedAction, error: RemoteError) -> bool {
        *self.last_error.write() = Some(error.to_string());

        let updated = {
            let mut state = self.state.lock().await;
            let Some(pos) = state.actions.iter().position(|a| a.id == action.id) else {
                return false;
            };

            let entry = &mut state.actions[pos];
            entry.attempts = (entry.attempts + 1).min(entry.max_attempts);
            entry.last_error = Some(error.to_string());
            entry.status = ActionStatus::Failed;
            let updated = entry.clone();

            if updated.is_exhausted() {
                state.actions.remove(pos);
            }
            self.persist(&mut state).await;
            updated
        };

        if updated.is_exhausted() {
            tracing::error!(
                "{} on {} dropped after {} attempts (id={}): {}",
                updated.kind,
                updated.target,
                updated.attempts,
                updated.id,
                error
            );
            let hook = self.on_terminal_failure.read().clone();
            if let Some(hook) = hook {
                hook(&updated, &error);
            }
            let _ = self.events.send(QueueEvent::TerminalFailure {
                action: updated,
                error,
            });
            true
        } else {
            tracing::warn!(
                "{} on {} failed (attempt {}/{}, id={}): {}",
                updated.kind,
                updated.target,
                updated.attempts,
                updated.max_attempts,
                updated.id,
                error
            );
            let _ = self.events.send(QueueEvent::Failed {
                action: updated,
                error,
            });
            false
        }
    }

    fn record_timing(&self, elapsed: Duration, success: bool) {
        let mut acc = self.stats.lock();
        acc.total_processed += 1;
        acc.total_time += elapsed;
        if success {
            acc.success_count += 1;
        } else {
            acc.error_count += 1;
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::{DashMapKeyValueStore, DashMapRemoteStore, WatchConnectivity};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    fn record(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    struct Harness {
        kv: DashMapKeyValueStore,
        remote: DashMapRemoteStore,
        connectivity: WatchConnectivity,
    }

    impl Harness {
        fn new(online: bool) -> Self {
            Self {
                kv: DashMapKeyValueStore::new(),
                remote: DashMapRemoteStore::new(),
                connectivity: WatchConnectivity::new(online),
            }
        }

        fn queue(&self, config: QueueConfig) -> ActionQueue {
            ActionQueue::new(
                Arc::new(self.kv.clone()),
                Arc::new(self.remote.clone()),
                Arc::new(self.connectivity.clone()),
                config,
            )
        }
    }

    fn fast() -> QueueConfig {
        QueueConfig::new().backoff(Duration::from_millis(5), Duration::from_millis(50))
    }

    // ===== Config Tests =====

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = QueueConfig::new().backoff(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(config.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(config.backoff_delay(4), Duration::from_secs(10));
        assert_eq!(config.backoff_delay(40), Duration::from_secs(10));
    }

    #[test]
    fn test_config_validation() {
        assert!(QueueConfig::default().validate().is_ok());
        assert_eq!(
            QueueConfig::new().batch_size(0).validate(),
            Err(ConfigError::ZeroBatchSize)
        );
        assert_eq!(
            QueueConfig::new().max_attempts(0).validate(),
            Err(ConfigError::ZeroMaxAttempts)
        );
        assert_eq!(
            QueueConfig::new()
                .backoff(Duration::from_secs(10), Duration::from_secs(1))
                .validate(),
            Err(ConfigError::InvalidBackoff)
        );
    }

    // ===== Enqueue Tests =====

    #[tokio::test]
    async fn test_enqueue_defaults_priority_by_kind() {
        let h = Harness::new(false);
        let queue = h.queue(fast());

        let insert = queue
            .enqueue(NewAction::insert("products", record(json!({"id": "p1"}))))
            .await
            .unwrap();
        let delete = queue
            .enqueue(NewAction::delete("products", Selector::by_id("p2")))
            .await
            .unwrap();
        let low = queue
            .enqueue(
                NewAction::update("products", record(json!({"a": 1})), Selector::by_id("p3"))
                    .priority(ActionPriority::Low),
            )
            .await
            .unwrap();

        assert_eq!(queue.get(&insert).await.unwrap().priority, ActionPriority::Normal);
        assert_eq!(queue.get(&delete).await.unwrap().priority, ActionPriority::High);
        assert_eq!(queue.get(&low).await.unwrap().priority, ActionPriority::Low);
        assert_eq!(queue.get(&insert).await.unwrap().max_attempts, 3);
        assert_eq!(queue.size().await, 3);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_incomplete_actions() {
        let h = Harness::new(false);
        let queue = h.queue(fast());

        assert_eq!(
            queue.enqueue(NewAction::new(ActionKind::Insert, "products")).await,
            Err(QueueError::MissingPayload(ActionKind::Insert))
        );
        assert_eq!(
            queue.enqueue(NewAction::new(ActionKind::Delete, "products")).await,
            Err(QueueError::MissingSelector(ActionKind::Delete))
        );
        assert_eq!(
            queue
                .enqueue(NewAction::insert("", record(json!({}))))
                .await,
            Err(QueueError::MissingTarget)
        );
        assert_eq!(queue.size().await, 0);
    }

    #[tokio::test]
    async fn test_enqueue_persists_before_returning() {
        let h = Harness::new(false);
        let queue = h.queue(fast());
        let id = queue
            .enqueue(NewAction::insert("products", record(json!({"id": "p1"}))))
            .await
            .unwrap();

        let blob = h.kv.get(QUEUE_NAMESPACE, QUEUE_KEY).await.unwrap().unwrap();
        let persisted: Vec<Value> = serde_json::from_str(&blob).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0]["id"], json!(id));
        assert_eq!(persisted[0]["kind"], json!("insert"));
        assert_eq!(persisted[0]["status"], json!("pending"));
        assert_eq!(persisted[0]["maxAttempts"], json!(3));
        assert!(persisted[0]["createdAt"].as_str().unwrap().contains('T'));
    }

    // ===== Processing Tests =====

    #[tokio::test]
    async fn test_process_offline_is_noop() {
        let h = Harness::new(false);
        let queue = h.queue(fast());
        queue
            .enqueue(NewAction::insert("products", record(json!({"id": "p1"}))))
            .await
            .unwrap();

        assert_eq!(queue.process().await, PassSummary::default());
        assert_eq!(queue.size().await, 1);
        assert!(h.remote.dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_process_dispatches_priority_then_age() {
        let h = Harness::new(false);
        let queue = h.queue(fast());

        queue
            .enqueue(NewAction::insert("t", record(json!({"id": "low"}))).priority(ActionPriority::Low))
            .await
            .unwrap();
        queue
            .enqueue(NewAction::insert("t", record(json!({"id": "n1"}))))
            .await
            .unwrap();
        queue
            .enqueue(NewAction::upsert("t", record(json!({"id": "high"}))).priority(ActionPriority::High))
            .await
            .unwrap();
        queue
            .enqueue(NewAction::insert("t", record(json!({"id": "n2"}))))
            .await
            .unwrap();

        h.connectivity.set_online(true);
        let summary = queue.process().await;
        assert_eq!(summary.succeeded, 4);

        let order: Vec<String> = h
            .remote
            .dispatches()
            .into_iter()
            .filter_map(|d| d.record_id)
            .collect();
        assert_eq!(order, vec!["high", "n1", "n2", "low"]);
        assert_eq!(queue.size().await, 0);
    }

    #[tokio::test]
    async fn test_process_respects_batch_size() {
        let h = Harness::new(true);
        let queue = h.queue(fast().batch_size(2));
        for i in 0..5 {
            queue
                .enqueue(NewAction::insert("t", record(json!({"id": i}))))
                .await
                .unwrap();
        }

        assert_eq!(queue.process().await.dispatched, 2);
        assert_eq!(queue.size().await, 3);
    }

    #[tokio::test]
    async fn test_drain_runs_until_empty() {
        let h = Harness::new(true);
        let queue = h.queue(fast().batch_size(2));
        for i in 0..5 {
            queue
                .enqueue(NewAction::insert("t", record(json!({"id": i}))))
                .await
                .unwrap();
        }

        let summary = queue.drain().await;
        assert_eq!(summary.succeeded, 5);
        assert_eq!(queue.size().await, 0);
    }

    #[tokio::test]
    async fn test_success_event_carries_response() {
        let h = Harness::new(true);
        let queue = h.queue(fast());
        let mut events = queue.subscribe();

        queue
            .enqueue(NewAction::insert("t", record(json!({"name": "no id yet"}))))
            .await
            .unwrap();
        queue.process().await;

        loop {
            match events.recv().await.unwrap() {
                QueueEvent::Succeeded { action, response } => {
                    assert_eq!(action.status, ActionStatus::Completed);
                    assert!(response[0].contains_key("id"));
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_failure_marks_failed_and_counts_attempt() {
        let h = Harness::new(true);
        let queue = h.queue(fast());
        let id = queue
            .enqueue(NewAction::insert("t", record(json!({"id": "p1"}))))
            .await
            .unwrap();

        h.remote.fail_next(1);
        let summary = queue.process().await;
        assert_eq!(summary.failed, 1);

        let action = queue.get(&id).await.unwrap();
        assert_eq!(action.status, ActionStatus::Failed);
        assert_eq!(action.attempts, 1);
        assert!(action.last_error.is_some());
        assert!(queue.last_error().is_some());

        // failed actions wait for retry_failed
        assert_eq!(queue.process().await.dispatched, 0);
    }

    #[tokio::test]
    async fn test_terminal_failure_after_max_attempts() {
        let h = Harness::new(true);
        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = dropped.clone();
        let queue = h.queue(fast().max_attempts(3)).on_terminal_failure(move |action, _| {
            assert_eq!(action.attempts, 3);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        queue
            .enqueue(NewAction::insert("products", record(json!({"id": "p1"}))))
            .await
            .unwrap();
        h.remote.fail_next(3);

        queue.process().await;
        queue.retry_failed().await;
        assert_eq!(queue.by_status(ActionStatus::Failed).await.len(), 1);
        queue.retry_failed().await;

        assert!(queue.by_status(ActionStatus::Failed).await.is_empty());
        assert_eq!(queue.size().await, 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().error_count, 3);
    }

    #[tokio::test]
    async fn test_timeout_is_a_normal_failure() {
        let h = Harness::new(true);
        let queue = h.queue(fast().remote_timeout(Duration::from_millis(20)));
        let id = queue
            .enqueue(NewAction::insert("t", record(json!({"id": "slow"}))))
            .await
            .unwrap();

        h.remote.set_latency(Duration::from_millis(200));
        queue.process().await;

        let action = queue.get(&id).await.unwrap();
        assert_eq!(action.status, ActionStatus::Failed);
        assert!(action.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_retry_failed_waits_for_backoff() {
        let h = Harness::new(true);
        let queue = h.queue(
            QueueConfig::new().backoff(Duration::from_millis(40), Duration::from_secs(1)),
        );
        queue
            .enqueue(NewAction::insert("t", record(json!({"id": "p1"}))))
            .await
            .unwrap();
        h.remote.fail_next(1);
        queue.process().await;

        let started = Instant::now();
        queue.retry_failed().await;

        // one failure: 40ms * 2^1
        assert!(started.elapsed() >= Duration::from_millis(70));
        assert_eq!(queue.size().await, 0);
        assert!(h.remote.record("t", "p1").is_some());
    }

    #[tokio::test]
    async fn test_schedule_retries_defers_dispatch() {
        let h = Harness::new(true);
        let queue = h.queue(
            QueueConfig::new().backoff(Duration::from_secs(60), Duration::from_secs(120)),
        );
        let id = queue
            .enqueue(NewAction::insert("t", record(json!({"id": "p1"}))))
            .await
            .unwrap();
        h.remote.fail_next(1);
        queue.process().await;

        assert_eq!(queue.schedule_retries().await, 1);
        let action = queue.get(&id).await.unwrap();
        assert_eq!(action.status, ActionStatus::Pending);
        assert!(action.retry_at.unwrap() > Utc::now());
        assert_eq!(queue.process().await.dispatched, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let h = Harness::new(true);
        let queue = h.queue(fast());
        for i in 0..3 {
            queue
                .enqueue(NewAction::insert("t", record(json!({"id": i}))))
                .await
                .unwrap();
        }
        h.remote.fail_next(1);
        queue.process().await;

        let stats = queue.stats();
        assert_eq!(stats.total_processed, 3);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.error_count, 1);
    }

    // ===== Query and Clear Tests =====

    #[tokio::test]
    async fn test_filters_and_clear() {
        let h = Harness::new(false);
        let queue = h.queue(fast());
        queue
            .enqueue(NewAction::insert("a", record(json!({"id": 1}))))
            .await
            .unwrap();
        queue
            .enqueue(NewAction::delete("a", Selector::by_id("2")))
            .await
            .unwrap();
        queue
            .enqueue(NewAction::insert("b", record(json!({"id": 3}))))
            .await
            .unwrap();

        assert_eq!(queue.by_table("a").await.len(), 2);
        assert_eq!(queue.by_kind(ActionKind::Insert).await.len(), 2);
        assert_eq!(queue.by_priority(ActionPriority::High).await.len(), 1);
        assert_eq!(queue.by_status(ActionStatus::Pending).await.len(), 3);
        assert_eq!(queue.pending_for("b").await.len(), 1);

        let removed = queue
            .clear(Some(ActionFilter::new().target("a").kind(ActionKind::Insert)))
            .await;
        assert_eq!(removed, 1);
        assert_eq!(queue.size().await, 2);

        assert_eq!(queue.clear(None).await, 2);
        assert_eq!(queue.size().await, 0);
    }

    // ===== Persistence Tests =====

    #[tokio::test]
    async fn test_reload_roundtrip() {
        let h = Harness::new(false);
        let first = h.queue(fast());
        let id = first
            .enqueue(NewAction::delete("products", Selector::by_id("p1")))
            .await
            .unwrap();

        let second = h.queue(fast());
        assert_eq!(second.reload().await, 1);
        assert_eq!(second.get(&id).await, first.get(&id).await);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_corrupt_blob_is_empty_queue() {
        let h = Harness::new(false);
        h.kv
            .set(QUEUE_NAMESPACE, QUEUE_KEY, "{{not json".to_string())
            .await
            .unwrap();

        let queue = h.queue(fast());
        assert_eq!(queue.reload().await, 0);
        assert!(logs_contain("persisted queue is malformed"));
    }

    #[tokio::test]
    async fn test_legacy_elements_are_migrated() {
        let h = Harness::new(false);
        let legacy = json!([
            {
                "id": "old-1",
                "type": "delete",
                "table": "products",
                "selector": {"id": "p9"},
                "attempts": 1,
                "createdAt": "2024-01-01T10:00:00Z"
            },
            {
                "id": "old-2",
                "kind": "insert",
                "target": "products",
                "payload": {"id": "p10"},
                "status": "processing",
                "createdAt": "2024-01-01T10:00:01Z"
            },
            {"garbage": true}
        ]);
        h.kv
            .set(QUEUE_NAMESPACE, QUEUE_KEY, legacy.to_string())
            .await
            .unwrap();

        let queue = h.queue(fast());
        assert_eq!(queue.reload().await, 2);

        let old1 = queue.get("old-1").await.unwrap();
        assert_eq!(old1.priority, ActionPriority::High);
        assert_eq!(old1.status, ActionStatus::Pending);
        assert_eq!(old1.max_attempts, 3);

        let old2 = queue.get("old-2").await.unwrap();
        assert_eq!(old2.priority, ActionPriority::Normal);
        assert_eq!(old2.status, ActionStatus::Pending);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_memory_state() {
        let kv = DashMapKeyValueStore::new().with_quota(16);
        let remote = DashMapRemoteStore::new();
        let queue = ActionQueue::new(
            Arc::new(kv),
            Arc::new(remote),
            Arc::new(WatchConnectivity::new(false)),
            fast(),
        );

        queue
            .enqueue(NewAction::insert("products", record(json!({"id": "p1"}))))
            .await
            .unwrap();
        assert_eq!(queue.size().await, 1);
        assert!(queue.last_error().unwrap().contains("quota"));
    }

    // ===== Background Loop Tests =====

    #[tokio::test]
    async fn test_loop_drains_on_reconnect() {
        let h = Harness::new(false);
        let queue = Arc::new(h.queue(fast()));
        queue
            .enqueue(NewAction::insert("t", record(json!({"id": "p1"}))))
            .await
            .unwrap();

        let (tx, _) = broadcast::channel(1);
        let handle = queue.start(tx.subscribe());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.size().await, 1);

        h.connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.size().await, 0);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_loop_reloads_external_changes() {
        let h = Harness::new(false);
        let mine = Arc::new(h.queue(fast()));
        let (tx, _) = broadcast::channel(1);
        let handle = mine.start(tx.subscribe());

        let other = h.queue(fast());
        other
            .enqueue(NewAction::insert("t", record(json!({"id": "from-other"}))))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mine.size().await, 1);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
