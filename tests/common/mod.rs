//! Shared wiring for integration tests.

#![allow(dead_code)]

use offline_sync::adapters::outbound::{DashMapKeyValueStore, DashMapRemoteStore, WatchConnectivity};
use offline_sync::{Record, SyncAgent, SyncConfig};
use serde_json::Value;
use std::sync::Arc;

pub struct Env {
    pub agent: Arc<SyncAgent>,
    pub kv: DashMapKeyValueStore,
    pub remote: DashMapRemoteStore,
    pub connectivity: WatchConnectivity,
}

pub fn record(v: Value) -> Record {
    v.as_object().cloned().unwrap()
}

pub fn fast_config() -> SyncConfig {
    SyncConfig {
        queue_base_delay_ms: 5,
        queue_max_delay_ms: 40,
        reconnect_debounce_ms: 10,
        remote_timeout_ms: 200,
        ..Default::default()
    }
}

pub fn env(online: bool) -> Env {
    env_with(online, fast_config())
}

pub fn env_with(online: bool, config: SyncConfig) -> Env {
    let kv = DashMapKeyValueStore::new();
    let remote = DashMapRemoteStore::new();
    let connectivity = WatchConnectivity::new(online);
    let agent = SyncAgent::new(
        Arc::new(kv.clone()),
        Arc::new(remote.clone()),
        Arc::new(connectivity.clone()),
        &config,
    )
    .unwrap();

    Env {
        agent: Arc::new(agent),
        kv,
        remote,
        connectivity,
    }
}
