//! Sync status tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Phase of the sync orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncPhase {
    /// Nothing running; timers may be armed.
    #[default]
    Idle,
    /// A cycle is in progress.
    Syncing,
    /// Last cycle failed; another is scheduled after the retry delay.
    AwaitingRetry,
}

/// Connectivity as reported by the network status provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    #[default]
    Online,
    Offline,
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkStatus::Online => f.write_str("online"),
            NetworkStatus::Offline => f.write_str("offline"),
        }
    }
}

/// Snapshot of the engine's sync status.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// A cycle currently holds the sync lock.
    pub is_syncing: bool,
    /// Start time of the last fully successful cycle.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Changes waiting in the offline queue.
    pub pending_changes: usize,
    /// Unresolved conflicts.
    pub conflicts: usize,
    pub network_status: NetworkStatus,
    /// Last failure, cleared by a successful cycle.
    pub error: Option<String>,
    pub phase: SyncPhase,
    /// Consecutive failed cycles.
    pub retry_attempts: u32,
}

impl SyncStatus {
    /// Enter a phase, keeping `is_syncing` consistent with it.
    pub fn enter(&mut self, phase: SyncPhase) {
        self.phase = phase;
        self.is_syncing = phase == SyncPhase::Syncing;
    }
}

/// Single-writer status owned by the engine.
///
/// Readers take snapshots or subscribe for changes; only the engine writes.
#[derive(Debug)]
pub struct StatusCell {
    tx: watch::Sender<SyncStatus>,
}

impl StatusCell {
    /// Create a cell holding `initial`.
    pub fn new(initial: SyncStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Copy of the current status.
    pub fn snapshot(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every update.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Apply `f` to the status and notify subscribers.
    pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.tx.send_modify(f);
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(SyncStatus::default())
    }
}
