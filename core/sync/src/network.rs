//! Network status source injected into the scheduler.

use tokio::sync::watch;
use tracing::info;

use crate::state::NetworkStatus;

/// Source of connectivity information.
///
/// Platform integrations (OS reachability APIs, browser events, a polling
/// loop) implement this; the engine only sees the current value and the
/// transitions.
pub trait NetworkStatusProvider: Send + Sync {
    /// Current connectivity.
    fn current(&self) -> NetworkStatus;

    /// Receiver that observes every transition.
    fn subscribe(&self) -> watch::Receiver<NetworkStatus>;
}

/// Network status provider driven by explicit calls.
#[derive(Debug)]
pub struct NetworkMonitor {
    tx: watch::Sender<NetworkStatus>,
}

impl NetworkMonitor {
    /// Create a monitor starting at `initial`.
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Report connectivity. Returns true if this was a transition.
    pub fn set_status(&self, status: NetworkStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!("Network is now {}", status);
        }
        changed
    }

    pub fn go_online(&self) -> bool {
        self.set_status(NetworkStatus::Online)
    }

    pub fn go_offline(&self) -> bool {
        self.set_status(NetworkStatus::Offline)
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::Online)
    }
}

impl NetworkStatusProvider for NetworkMonitor {
    fn current(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}
