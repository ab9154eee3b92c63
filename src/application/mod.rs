//! Application Layer
//!
//! Use cases consumed by host applications.

pub mod offline_store;
pub mod sync_agent;

pub use offline_store::{OfflineStore, StoreConfig, SyncStatus};
pub use sync_agent::{AgentConfig, SyncAgent};
