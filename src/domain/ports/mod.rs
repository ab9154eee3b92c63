mod connectivity;
mod kv_store;
mod remote_store;

pub use connectivity::ConnectivitySource;
pub use kv_store::KeyValueStore;
pub use remote_store::RemoteStore;
