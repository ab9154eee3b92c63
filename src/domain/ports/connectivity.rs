//! Connectivity Port
//!
//! Defines the interface through which the host reports reachability.

use crate::domain::value_objects::NetworkStatus;
use tokio::sync::watch;

/// Source of online/offline signals.
///
/// Only the edges of `online` drive behaviour; link quality is informational.
pub trait ConnectivitySource: Send + Sync {
    /// Current snapshot.
    fn status(&self) -> NetworkStatus;

    /// Receiver observing every change.
    fn subscribe(&self) -> watch::Receiver<NetworkStatus>;

    fn is_online(&self) -> bool {
        self.status().online
    }
}
