//! Sync Agent
//!
//! Wires the cache, queue and conflict engine to a set of per-collection
//! stores and runs the reactor that feeds them: connectivity edges, remote
//! change notifications, queue successes and conflict resolutions.

use crate::adapters::outbound::SqliteKeyValueStore;
use crate::application::offline_store::{OfflineStore, StoreConfig};
use crate::config::SyncConfig;
use crate::domain::entities::QueuedAction;
use crate::domain::ports::{ConnectivitySource, KeyValueStore, RemoteStore};
use crate::error::{ConfigError, RemoteError};
use crate::infrastructure::{
    ActionQueue, CacheStore, ConflictEngine, ConflictEvent, QueueEvent, ShutdownController,
};
use dashmap::DashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Sleep;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Quiet period after coming online before the reconnect sequence (default: 1s)
    pub reconnect_debounce: Duration,
    /// Remote timeout handed to stores created by the agent (default: 10s)
    pub remote_timeout: Duration,
    /// How long `stop` waits for a running reconnect (default: 5s)
    pub idle_timeout: Duration,
    /// Interval of the conflict cleanup sweep (default: 1h)
    pub conflict_cleanup_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            reconnect_debounce: Duration::from_secs(1),
            remote_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(5),
            conflict_cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconnect_debounce(mut self, debounce: Duration) -> Self {
        self.reconnect_debounce = debounce;
        self
    }

    pub fn remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn conflict_cleanup_interval(mut self, interval: Duration) -> Self {
        self.conflict_cleanup_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_timeout.is_zero() {
            return Err(ConfigError::InvalidInterval("remote_timeout"));
        }
        if self.conflict_cleanup_interval.is_zero() {
            return Err(ConfigError::InvalidInterval("conflict_cleanup_interval"));
        }
        Ok(())
    }
}

/// Owner of the shared engines and the background reactor.
pub struct SyncAgent {
    config: AgentConfig,
    cache: Arc<CacheStore>,
    queue: Arc<ActionQueue>,
    conflicts: Arc<ConflictEngine>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn ConnectivitySource>,
    stores: DashMap<String, Arc<OfflineStore>>,
    shutdown: ShutdownController,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SyncAgent {
    /// Build the engines over a key/value store.
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn ConnectivitySource>,
        config: &SyncConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let agent_config = config.agent();
        agent_config.validate()?;

        let cache = Arc::new(CacheStore::new(kv.clone(), config.cache()));
        let queue = Arc::new(ActionQueue::new(
            kv.clone(),
            remote.clone(),
            connectivity.clone(),
            config.queue(),
        ));
        let conflicts = Arc::new(ConflictEngine::new(kv, remote.clone(), config.conflicts()?));

        Ok(Self {
            config: agent_config,
            cache,
            queue,
            conflicts,
            remote,
            connectivity,
            stores: DashMap::new(),
            shutdown: ShutdownController::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Build an agent persisting to the SQLite file named in the config.
    pub async fn open(
        config: &SyncConfig,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn ConnectivitySource>,
    ) -> anyhow::Result<Self> {
        let mut kv = SqliteKeyValueStore::open(&config.db_path)?;
        if let Some(quota) = config.storage_quota_bytes {
            kv = kv.with_quota(quota);
        }
        tracing::info!("opened offline store at {}", config.db_path);

        let agent = Self::new(Arc::new(kv), remote, connectivity, config)?;
        agent.initialize().await;
        Ok(agent)
    }

    /// Load persisted queue and conflict state.
    pub async fn initialize(&self) {
        let actions = self.queue.reload().await;
        let conflicts = self.conflicts.reload().await;
        tracing::info!("restored {} queued actions and {} conflicts", actions, conflicts);
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn conflicts(&self) -> &Arc<ConflictEngine> {
        &self.conflicts
    }

    /// Report actions dropped after their last attempt.
    pub fn on_terminal_failure<F>(&self, hook: F)
    where
        F: Fn(&QueuedAction, &RemoteError) + Send + Sync + 'static,
    {
        self.queue.set_terminal_failure_hook(Arc::new(hook));
    }

    /// Store for a collection, created and registered on first use.
    pub fn store(&self, collection: &str) -> Result<Arc<OfflineStore>, ConfigError> {
        if let Some(store) = self.stores.get(collection) {
            return Ok(Arc::clone(store.value()));
        }
        let config = StoreConfig::new(collection).remote_timeout(self.config.remote_timeout);
        let store = Arc::new(OfflineStore::new(
            config,
            self.cache.clone(),
            self.queue.clone(),
            self.conflicts.clone(),
            self.remote.clone(),
            self.connectivity.clone(),
        )?);
        self.register(store.clone());
        Ok(store)
    }

    /// Register a store so the reactor routes its events to it.
    pub fn register(&self, store: Arc<OfflineStore>) {
        tracing::debug!("registered store {}", store.collection());
        self.stores.insert(store.collection().to_string(), store);
    }

    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    /// Drain the queue, retry failed actions, then refresh every store.
    ///
    /// The refresh comes last so the remote read includes this session's writes.
    pub async fn reconnect(&self) {
        if !self.connectivity.is_online() || self.shutdown.is_shutdown() {
            return;
        }
        let _pass = self.shutdown.pass_guard();

        tracing::info!("reconnect: draining queue");
        let drained = self.queue.drain().await;
        tracing::info!("reconnect: retrying failed actions");
        self.queue.retry_failed().await;

        for store in self.snapshot() {
            if let Err(e) = store.refresh().await {
                tracing::warn!("reconnect: refresh of {} failed: {}", store.collection(), e);
            }
        }
        tracing::info!(
            "reconnect finished: {} dispatched, {} still queued",
            drained.dispatched,
            self.queue.size().await
        );
    }

    /// Start the queue loop, the cache sweep and the reactor.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.queue.start(self.shutdown.subscribe()));
        tasks.push(self.cache.start_cleanup(self.shutdown.subscribe()));
        tasks.push(self.start_reactor());
        tracing::info!("sync agent started");
    }

    /// Stop every loop and cancel pending reconnects and backoff timers.
    pub async fn stop(&self) {
        self.shutdown.shutdown();
        if !self.shutdown.wait_for_idle(self.config.idle_timeout).await {
            tracing::warn!("stopping with a reconnect still running");
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        tracing::info!("sync agent stopped");
    }

    fn snapshot(&self) -> Vec<Arc<OfflineStore>> {
        self.stores.iter().map(|s| Arc::clone(s.value())).collect()
    }

    fn route(&self, collection: &str) -> Option<Arc<OfflineStore>> {
        self.stores.get(collection).map(|s| Arc::clone(s.value()))
    }

    fn start_reactor(self: &Arc<Self>) -> JoinHandle<()> {
        let agent = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut connectivity = agent.connectivity.subscribe();
            let mut online = connectivity.borrow_and_update().online;
            let mut remote_changes = agent.remote.subscribe();
            let mut queue_events = agent.queue.subscribe();
            let mut conflict_events = agent.conflicts.subscribe();
            let (mut remote_open, mut queue_open, mut conflicts_open) = (true, true, true);

            let mut debounce: Option<Pin<Box<Sleep>>> = None;
            let period = agent.config.conflict_cleanup_interval;
            let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::debug!("sync reactor stopped");
                        break;
                    }
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let now_online = connectivity.borrow_and_update().online;
                        if now_online && !online {
                            tracing::info!("connectivity restored");
                            debounce = Some(Box::pin(tokio::time::sleep(agent.config.reconnect_debounce)));
                        } else if !now_online && online {
                            tracing::info!("connectivity lost");
                            debounce = None;
                        }
                        online = now_online;
                    }
                    _ = debounce_elapsed(&mut debounce) => {
                        debounce = None;
                        let runner = Arc::clone(&agent);
                        let handle = tokio::spawn(async move { runner.reconnect().await });
                        let mut tasks = agent.tasks.lock();
                        tasks.retain(|t| !t.is_finished());
                        tasks.push(handle);
                    }
                    change = remote_changes.recv(), if remote_open => match change {
                        Ok(change) => {
                            if let Some(store) = agent.route(&change.collection) {
                                store.apply_remote_change(&change).await;
                            }
                        }
                        Err(RecvError::Lagged(n)) => tracing::warn!("missed {} remote changes", n),
                        Err(RecvError::Closed) => remote_open = false,
                    },
                    event = queue_events.recv(), if queue_open => match event {
                        Ok(QueueEvent::Succeeded { action, response }) => {
                            if let Some(store) = agent.route(&action.target) {
                                store.reconcile_action(&action, &response).await;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => tracing::warn!("missed {} queue events", n),
                        Err(RecvError::Closed) => queue_open = false,
                    },
                    event = conflict_events.recv(), if conflicts_open => match event {
                        Ok(ConflictEvent::Resolved(conflict)) => {
                            if let Some(store) = agent.route(&conflict.collection) {
                                store.settle_conflict(&conflict).await;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => tracing::warn!("missed {} conflict events", n),
                        Err(RecvError::Closed) => conflicts_open = false,
                    },
                    _ = sweep.tick() => {
                        agent.conflicts.cleanup_expired().await;
                    }
                }
            }
        })
    }
}

async fn debounce_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(t) => t.as_mut().await,
        None => std::future::pending::<()>().await,
    }
}
