mod dashmap_kv_store;
mod dashmap_remote_store;
mod sqlite_kv_store;
mod watch_connectivity;

pub use dashmap_kv_store::DashMapKeyValueStore;
pub use dashmap_remote_store::{DashMapRemoteStore, Dispatch};
pub use sqlite_kv_store::SqliteKeyValueStore;
pub use watch_connectivity::WatchConnectivity;
