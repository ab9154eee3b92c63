//! Watch Connectivity
//!
//! ConnectivitySource backed by a tokio watch channel. The host pushes
//! status snapshots; subscribers observe the latest value.

use crate::domain::ports::ConnectivitySource;
use crate::domain::value_objects::NetworkStatus;
use tokio::sync::watch;

/// Host-driven connectivity signal.
#[derive(Clone)]
pub struct WatchConnectivity {
    tx: watch::Sender<NetworkStatus>,
}

impl WatchConnectivity {
    pub fn new(online: bool) -> Self {
        let initial = if online {
            NetworkStatus::online()
        } else {
            NetworkStatus::offline()
        };
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Flip the online flag, keeping link metadata. No-op when unchanged.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|status| {
            if status.online == online {
                return false;
            }
            status.online = online;
            true
        });
    }

    /// Replace the whole snapshot. No-op when unchanged.
    pub fn set_status(&self, next: NetworkStatus) {
        self.tx.send_if_modified(|status| {
            if *status == next {
                return false;
            }
            *status = next;
            true
        });
    }
}

impl ConnectivitySource for WatchConnectivity {
    fn status(&self) -> NetworkStatus {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}
