//! offline-sync
//!
//! Offline-first data access: a TTL cache, a persistent retrying action
//! queue and a conflict engine, orchestrated per collection by
//! `OfflineStore` and kept in sync by `SyncAgent`.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod telemetry;

// Re-export commonly used types
pub use application::{AgentConfig, OfflineStore, StoreConfig, SyncAgent, SyncStatus};
pub use config::{load_config, SyncConfig};
pub use domain::entities::{
    ActionKind, ActionPriority, ActionStatus, ChangeEvent, Conflict, ConflictKind,
    ConflictPriority, ConflictStatus, NewAction, QueuedAction, RemoteChange,
};
pub use domain::ports::{ConnectivitySource, KeyValueStore, RemoteStore};
pub use domain::value_objects::{FieldRule, NetworkStatus, Record, ResolutionStrategy, Selector};
pub use error::{ConfigError, ConflictError, QueueError, RemoteError, StorageError};
pub use infrastructure::{
    ActionFilter, ActionQueue, CacheConfig, CacheStore, ConflictConfig, ConflictEngine,
    QueueConfig,
};
pub use telemetry::init_tracing;
