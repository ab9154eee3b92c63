use crate::application::AgentConfig;
use crate::domain::services::DetectionRules;
use crate::domain::value_objects::ResolutionStrategy;
use crate::error::ConfigError;
use crate::infrastructure::{CacheConfig, ConflictConfig, QueueConfig};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    // Storage
    pub db_path: String,
    pub debug: bool,
    pub storage_quota_bytes: Option<usize>,

    // Cache
    pub cache_ttl_secs: u64,
    pub cache_compression: bool,
    pub cache_compression_threshold: usize,
    pub cache_cleanup_interval_secs: u64,

    // Queue
    pub queue_batch_size: usize,
    pub queue_max_attempts: u32,
    pub queue_base_delay_ms: u64,
    pub queue_max_delay_ms: u64,
    pub queue_drain_interval_secs: u64,
    pub remote_timeout_ms: u64,
    pub reconnect_debounce_ms: u64,

    // Conflicts
    pub conflict_window_secs: u64,
    pub conflict_auto_resolve: bool,
    pub conflict_default_strategy: String,
    pub conflict_max_auto_resolutions: usize,
    pub conflict_max_consecutive_failures: u32,
    pub conflict_max_age_hours: u64,
    pub conflict_retention_hours: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: "offline_sync.db".to_string(),
            debug: false,
            storage_quota_bytes: None,
            cache_ttl_secs: 86_400,
            cache_compression: true,
            cache_compression_threshold: 1024,
            cache_cleanup_interval_secs: 300,
            queue_batch_size: 10,
            queue_max_attempts: 3,
            queue_base_delay_ms: 1_000,
            queue_max_delay_ms: 300_000,
            queue_drain_interval_secs: 30,
            remote_timeout_ms: 10_000,
            reconnect_debounce_ms: 1_000,
            conflict_window_secs: 5,
            conflict_auto_resolve: false,
            conflict_default_strategy: "timestamp_wins".to_string(),
            conflict_max_auto_resolutions: 100,
            conflict_max_consecutive_failures: 3,
            conflict_max_age_hours: 168,
            conflict_retention_hours: 24,
        }
    }
}

impl SyncConfig {
    /// Cache settings. A TTL of zero means entries never expire.
    pub fn cache(&self) -> CacheConfig {
        let ttl = (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs));
        CacheConfig::new()
            .default_ttl(ttl)
            .compression(self.cache_compression)
            .compression_threshold(self.cache_compression_threshold)
            .cleanup_interval(Duration::from_secs(self.cache_cleanup_interval_secs))
    }

    pub fn queue(&self) -> QueueConfig {
        QueueConfig::new()
            .batch_size(self.queue_batch_size)
            .max_attempts(self.queue_max_attempts)
            .backoff(
                Duration::from_millis(self.queue_base_delay_ms),
                Duration::from_millis(self.queue_max_delay_ms),
            )
            .drain_interval(Duration::from_secs(self.queue_drain_interval_secs))
            .remote_timeout(Duration::from_millis(self.remote_timeout_ms))
    }

    /// Conflict settings. Fails on an unknown strategy name.
    pub fn conflicts(&self) -> Result<ConflictConfig, ConfigError> {
        let strategy = ResolutionStrategy::from_name(&self.conflict_default_strategy)
            .ok_or_else(|| ConfigError::UnknownStrategy(self.conflict_default_strategy.clone()))?;

        let rules = DetectionRules {
            concurrency_window: Duration::from_secs(self.conflict_window_secs),
            ..Default::default()
        };

        let mut config = ConflictConfig::new()
            .rules(rules)
            .max_auto_resolutions(self.conflict_max_auto_resolutions)
            .max_consecutive_failures(self.conflict_max_consecutive_failures)
            .max_age(Duration::from_secs(self.conflict_max_age_hours * 3600))
            .retention(Duration::from_secs(self.conflict_retention_hours * 3600))
            .remote_timeout(Duration::from_millis(self.remote_timeout_ms));
        if self.conflict_auto_resolve {
            config = config.auto_resolve(strategy);
        } else {
            config.default_strategy = strategy;
        }
        Ok(config)
    }

    pub fn agent(&self) -> AgentConfig {
        AgentConfig::new()
            .reconnect_debounce(Duration::from_millis(self.reconnect_debounce_ms))
            .remote_timeout(Duration::from_millis(self.remote_timeout_ms))
    }

    /// Validate every derived component configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache().validate()?;
        self.queue().validate()?;
        self.conflicts()?.validate()?;
        Ok(())
    }
}

pub fn load_config() -> anyhow::Result<SyncConfig> {
    let defaults = SyncConfig::default();

    let db_path = std::env::var("OFFLINE_SYNC_DB_PATH")
        .unwrap_or_else(|_| defaults.db_path.clone());

    let debug = std::env::var("DEBUG").is_ok() || env_flag("OFFLINE_SYNC_DEBUG", false);

    let storage_quota_bytes = std::env::var("OFFLINE_SYNC_STORAGE_QUOTA_BYTES")
        .ok()
        .and_then(|v| v.parse().ok());

    // Cache settings
    let cache_ttl_secs = env_parse("OFFLINE_SYNC_CACHE_TTL_SECS", defaults.cache_ttl_secs);
    let cache_compression = env_flag("OFFLINE_SYNC_CACHE_COMPRESSION", defaults.cache_compression);
    let cache_compression_threshold = env_parse(
        "OFFLINE_SYNC_CACHE_COMPRESSION_THRESHOLD",
        defaults.cache_compression_threshold,
    );
    let cache_cleanup_interval_secs = env_parse(
        "OFFLINE_SYNC_CACHE_CLEANUP_INTERVAL_SECS",
        defaults.cache_cleanup_interval_secs,
    );

    // Queue settings
    let queue_batch_size = env_parse("OFFLINE_SYNC_QUEUE_BATCH_SIZE", defaults.queue_batch_size);
    let queue_max_attempts = env_parse("OFFLINE_SYNC_QUEUE_MAX_ATTEMPTS", defaults.queue_max_attempts);
    let queue_base_delay_ms = env_parse("OFFLINE_SYNC_QUEUE_BASE_DELAY_MS", defaults.queue_base_delay_ms);
    let queue_max_delay_ms = env_parse("OFFLINE_SYNC_QUEUE_MAX_DELAY_MS", defaults.queue_max_delay_ms);
    let queue_drain_interval_secs = env_parse(
        "OFFLINE_SYNC_QUEUE_DRAIN_INTERVAL_SECS",
        defaults.queue_drain_interval_secs,
    );
    let remote_timeout_ms = env_parse("OFFLINE_SYNC_REMOTE_TIMEOUT_MS", defaults.remote_timeout_ms);
    let reconnect_debounce_ms = env_parse(
        "OFFLINE_SYNC_RECONNECT_DEBOUNCE_MS",
        defaults.reconnect_debounce_ms,
    );

    // Conflict settings
    let conflict_window_secs = env_parse("OFFLINE_SYNC_CONFLICT_WINDOW_SECS", defaults.conflict_window_secs);
    let conflict_auto_resolve = env_flag("OFFLINE_SYNC_CONFLICT_AUTO_RESOLVE", defaults.conflict_auto_resolve);
    let conflict_default_strategy = std::env::var("OFFLINE_SYNC_CONFLICT_DEFAULT_STRATEGY")
        .unwrap_or_else(|_| defaults.conflict_default_strategy.clone());
    let conflict_max_auto_resolutions = env_parse(
        "OFFLINE_SYNC_CONFLICT_MAX_AUTO_RESOLUTIONS",
        defaults.conflict_max_auto_resolutions,
    );
    let conflict_max_consecutive_failures = env_parse(
        "OFFLINE_SYNC_CONFLICT_MAX_CONSECUTIVE_FAILURES",
        defaults.conflict_max_consecutive_failures,
    );
    let conflict_max_age_hours = env_parse("OFFLINE_SYNC_CONFLICT_MAX_AGE_HOURS", defaults.conflict_max_age_hours);
    let conflict_retention_hours = env_parse(
        "OFFLINE_SYNC_CONFLICT_RETENTION_HOURS",
        defaults.conflict_retention_hours,
    );

    Ok(SyncConfig {
        db_path,
        debug,
        storage_quota_bytes,
        cache_ttl_secs,
        cache_compression,
        cache_compression_threshold,
        cache_cleanup_interval_secs,
        queue_batch_size,
        queue_max_attempts,
        queue_base_delay_ms,
        queue_max_delay_ms,
        queue_drain_interval_secs,
        remote_timeout_ms,
        reconnect_debounce_ms,
        conflict_window_secs,
        conflict_auto_resolve,
        conflict_default_strategy,
        conflict_max_auto_resolutions,
        conflict_max_consecutive_failures,
        conflict_max_age_hours,
        conflict_retention_hours,
    })
}

/// Parse a variable, falling back to the default when unset or invalid.
fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}
