//! Remote sync gateway abstraction.
//!
//! The gateway is the remote authority that accepts pushed changes and
//! serves changes made elsewhere. Transport and encoding belong to the
//! implementation; the engine only sees this trait.

mod memory;

pub use memory::MemoryGateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wayfarer_common::Result;

use crate::change::Change;
use crate::conflict::{Conflict, Resolution};

/// Per-change outcome of a push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOutcome {
    /// Accepted by the authority.
    pub applied: Vec<Change>,
    /// Collided with a newer remote change.
    pub conflicts: Vec<Conflict>,
    /// Rejected permanently.
    pub failed: Vec<Change>,
}

impl PushOutcome {
    /// Total number of changes accounted for.
    pub fn len(&self) -> usize {
        self.applied.len() + self.conflicts.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Remote authority for change synchronization.
///
/// All methods may block on the network. Implementations should bound
/// their own calls with a connection timeout; a timeout is reported as an
/// error like any other failure.
#[async_trait]
pub trait SyncGateway: Send + Sync {
    /// Get the gateway name (e.g., "memory", "rest").
    fn name(&self) -> &str;

    /// Submit a batch of local changes.
    ///
    /// # Postconditions
    /// - Every submitted change appears in exactly one outcome list
    ///
    /// # Errors
    /// - Network/authority failure; nothing in the batch is acknowledged
    async fn push_changes(&self, batch: &[Change]) -> Result<PushOutcome>;

    /// Changes the authority received after `since` (all when `None`).
    async fn pull_changes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Change>>;

    /// Settle a conflict with the change built for `resolution`.
    ///
    /// # Errors
    /// - Conflict unknown or already resolved
    /// - Network/authority failure
    async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
        resolved: &Change,
    ) -> Result<()>;

    /// Conflicts the authority still considers open.
    async fn list_conflicts(&self) -> Result<Vec<Conflict>>;

    /// Drop resolved conflicts on the authority side.
    async fn cleanup_resolved(&self) -> Result<()>;

    /// Whether the authority is reachable.
    async fn health_check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_outcome_serialization() {
        let outcome = PushOutcome::default();
        assert!(outcome.is_empty());

        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json.get("applied").is_some());
        assert!(json.get("conflicts").is_some());
        assert!(json.get("failed").is_some());
    }
}
