//! Durable, device-local queue of pending changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use wayfarer_common::{DeviceId, EntityKey, Error, Result};
use wayfarer_storage::RecordStore;

use crate::change::{Change, NewChange};
use crate::conflict::Conflict;

/// Name of the record the queue is persisted under.
pub const QUEUE_RECORD: &str = "offline_queue";

/// Current queue record format.
pub const QUEUE_FORMAT_VERSION: u32 = 1;

/// Persisted shape of the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineQueue {
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub version: u32,
    /// Counter stamped into each queued change's `version`.
    #[serde(default)]
    pub sequence: u64,
    /// Conflicts awaiting a decision. Their local changes left `changes`.
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
}

impl OfflineQueue {
    fn empty(device_id: &DeviceId) -> Self {
        Self {
            changes: Vec::new(),
            last_sync_time: None,
            device_id: device_id.to_string(),
            version: QUEUE_FORMAT_VERSION,
            sequence: 0,
            conflicts: Vec::new(),
        }
    }
}

/// Outcome of [`OfflineStore::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub defects: Vec<String>,
}

impl ValidationReport {
    /// True when no defects were found.
    pub fn is_ok(&self) -> bool {
        self.defects.is_empty()
    }
}

/// Collapse changes touching the same entity to the most recent one.
///
/// The change with the greatest timestamp wins; on equal timestamps the one
/// queued later wins. Survivors keep their original relative order.
pub fn deduplicate(changes: &[Change]) -> Vec<Change> {
    let mut winners: HashMap<EntityKey, usize> = HashMap::new();

    for (idx, change) in changes.iter().enumerate() {
        winners
            .entry(change.key())
            .and_modify(|current| {
                if change.timestamp >= changes[*current].timestamp {
                    *current = idx;
                }
            })
            .or_insert(idx);
    }

    let keep: HashSet<usize> = winners.into_values().collect();
    changes
        .iter()
        .enumerate()
        .filter(|(idx, _)| keep.contains(idx))
        .map(|(_, change)| change.clone())
        .collect()
}

/// Queue of local changes that the remote authority has not acknowledged.
///
/// Every mutation writes the full queue to the record store before the
/// in-memory copy is replaced; a failed write leaves both unchanged.
pub struct OfflineStore {
    backend: Arc<dyn RecordStore>,
    queue: OfflineQueue,
}

impl OfflineStore {
    /// Open the queue persisted in `backend`, or start an empty one.
    ///
    /// An existing record keeps the device id it was created with. For a
    /// fresh queue `device_id` is used, or a new one is generated. Nothing
    /// is written until the first mutation.
    ///
    /// # Errors
    /// - The stored record exists but cannot be parsed
    /// - Backend failure
    pub fn open(backend: Arc<dyn RecordStore>, device_id: Option<DeviceId>) -> Result<Self> {
        let queue = match backend.load(QUEUE_RECORD)? {
            Some(bytes) => {
                let queue: OfflineQueue = serde_json::from_slice(&bytes)?;
                if let Some(requested) = &device_id {
                    if !queue.device_id.is_empty() && queue.device_id != requested.as_str() {
                        warn!(
                            "Offline queue belongs to device {}, ignoring requested {}",
                            queue.device_id, requested
                        );
                    }
                }
                debug!("Loaded offline queue with {} changes", queue.changes.len());
                queue
            }
            None => OfflineQueue::empty(&device_id.unwrap_or_else(DeviceId::generate)),
        };

        Ok(Self { backend, queue })
    }

    /// Append a change, stamping id, timestamp, device and sequence.
    ///
    /// # Errors
    /// - Blank entity type or id
    /// - Backend failure (the change is not queued)
    pub fn enqueue(&mut self, change: NewChange) -> Result<String> {
        if change.entity_type.trim().is_empty() || change.entity_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Change needs an entity type and id".to_string(),
            ));
        }

        let mut next = self.queue.clone();
        next.sequence += 1;
        let id = Uuid::new_v4().to_string();
        next.changes.push(Change {
            id: id.clone(),
            kind: change.kind,
            entity_type: change.entity_type,
            entity_id: change.entity_id,
            payload: change.payload,
            timestamp: Utc::now(),
            origin_device: next.device_id.clone(),
            version: next.sequence,
        });

        self.commit(next)?;
        debug!("Queued change {}", id);
        Ok(id)
    }

    /// Pending changes in the order they were queued.
    pub fn pending(&self) -> impl Iterator<Item = &Change> + '_ {
        self.queue.changes.iter()
    }

    /// Look up a queued change.
    pub fn get(&self, id: &str) -> Option<&Change> {
        self.queue.changes.iter().find(|c| c.id == id)
    }

    /// Remove changes by id. Returns how many were removed.
    pub fn clear(&mut self, ids: &[String]) -> Result<usize> {
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut next = self.queue.clone();
        next.changes.retain(|c| !ids.contains(c.id.as_str()));

        let removed = self.queue.changes.len() - next.changes.len();
        if removed > 0 {
            self.commit(next)?;
        }
        Ok(removed)
    }

    /// Apply a push result in one write.
    ///
    /// Drops the `applied` ids and the local side of every conflict from the
    /// queue, and keeps the conflicts not already held. Returns those new
    /// conflicts.
    pub fn acknowledge(
        &mut self,
        applied: &[String],
        conflicts: Vec<Conflict>,
    ) -> Result<Vec<Conflict>> {
        let mut next = self.queue.clone();
        let mut added = Vec::new();
        for conflict in conflicts {
            if next.conflicts.iter().any(|c| c.id == conflict.id) {
                continue;
            }
            next.conflicts.push(conflict.clone());
            added.push(conflict);
        }

        let acknowledged: HashSet<&str> = applied
            .iter()
            .map(String::as_str)
            .chain(added.iter().map(|c| c.local_change.id.as_str()))
            .collect();
        next.changes.retain(|c| !acknowledged.contains(c.id.as_str()));

        if next.changes.len() != self.queue.changes.len() || !added.is_empty() {
            self.commit(next)?;
        }
        Ok(added)
    }

    /// Conflicts awaiting a decision, in detection order.
    pub fn conflicts(&self) -> &[Conflict] {
        &self.queue.conflicts
    }

    /// Look up a pending conflict.
    pub fn conflict(&self, id: &str) -> Option<&Conflict> {
        self.queue.conflicts.iter().find(|c| c.id == id)
    }

    /// Drop a settled conflict. Returns it if it was pending.
    pub fn remove_conflict(&mut self, id: &str) -> Result<Option<Conflict>> {
        let Some(pos) = self.queue.conflicts.iter().position(|c| c.id == id) else {
            return Ok(None);
        };
        let mut next = self.queue.clone();
        let removed = next.conflicts.remove(pos);
        self.commit(next)?;
        Ok(Some(removed))
    }

    /// Record the time of the last fully successful sync.
    pub fn mark_synced(&mut self, at: DateTime<Utc>) -> Result<()> {
        let mut next = self.queue.clone();
        next.last_sync_time = Some(at);
        self.commit(next)
    }

    /// De-duplicate the stored queue. Returns the ids that were dropped.
    pub fn compact(&mut self) -> Result<Vec<String>> {
        let survivors = deduplicate(&self.queue.changes);
        if survivors.len() == self.queue.changes.len() {
            return Ok(Vec::new());
        }

        let kept: HashSet<&str> = survivors.iter().map(|c| c.id.as_str()).collect();
        let dropped: Vec<String> = self
            .queue
            .changes
            .iter()
            .filter(|c| !kept.contains(c.id.as_str()))
            .map(|c| c.id.clone())
            .collect();

        let mut next = self.queue.clone();
        next.changes = survivors;
        self.commit(next)?;
        Ok(dropped)
    }

    /// Check the queue for defects without failing.
    pub fn validate(&self) -> ValidationReport {
        let mut defects = Vec::new();

        if self.queue.device_id.trim().is_empty() {
            defects.push("queue has no device id".to_string());
        }
        if self.queue.version == 0 {
            defects.push("queue has no format version".to_string());
        } else if self.queue.version > QUEUE_FORMAT_VERSION {
            defects.push(format!(
                "queue format version {} is newer than supported {}",
                self.queue.version, QUEUE_FORMAT_VERSION
            ));
        }

        let mut seen = HashSet::new();
        for (idx, change) in self.queue.changes.iter().enumerate() {
            let missing = change.missing_fields();
            if !missing.is_empty() {
                defects.push(format!(
                    "change #{} ({}) is missing {}",
                    idx,
                    if change.id.is_empty() { "<no id>" } else { change.id.as_str() },
                    missing.join(", ")
                ));
            }
            if !change.id.is_empty() && !seen.insert(change.id.as_str()) {
                defects.push(format!("change id {} appears more than once", change.id));
            }
        }

        ValidationReport { defects }
    }

    /// Drop the queue and its record.
    pub fn reset(&mut self) -> Result<()> {
        self.backend.remove(QUEUE_RECORD)?;
        let device_id =
            DeviceId::new(self.queue.device_id.clone()).unwrap_or_else(|_| DeviceId::generate());
        self.queue = OfflineQueue::empty(&device_id);
        Ok(())
    }

    /// Number of pending changes.
    pub fn len(&self) -> usize {
        self.queue.changes.len()
    }

    /// Check if no changes are pending.
    pub fn is_empty(&self) -> bool {
        self.queue.changes.is_empty()
    }

    /// Device this queue belongs to.
    pub fn device_id(&self) -> &str {
        &self.queue.device_id
    }

    /// Time of the last fully successful sync.
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.queue.last_sync_time
    }

    fn commit(&mut self, next: OfflineQueue) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&next)?;
        self.backend.save(QUEUE_RECORD, &bytes)?;
        self.queue = next;
        Ok(())
    }
}
