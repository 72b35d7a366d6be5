//! Conflict detection and resolution.
//!
//! Everything here is pure: no I/O, no clock reads except the fresh
//! timestamp stamped on a merged change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use wayfarer_common::{EntityKey, Error, Result};

use crate::change::{Change, ChangeKind};

/// How a conflict was, or should be, settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep the local change.
    Local,
    /// Keep the remote change.
    Remote,
    /// Field-wise merge of both payloads.
    Merge,
}

impl std::str::FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Resolution::Local),
            "remote" => Ok(Resolution::Remote),
            "merge" => Ok(Resolution::Merge),
            other => Err(Error::InvalidInput(format!("Unknown resolution: {}", other))),
        }
    }
}

/// Conflict resolution strategy applied without asking the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStrategy {
    /// Leave conflicts for the user.
    Manual,
    /// Keep the local side.
    PreferLocal,
    /// Keep the remote side.
    PreferRemote,
    /// Merge payloads where allowed.
    Merge,
}

impl ConflictStrategy {
    /// The resolution this strategy picks, if any.
    pub fn choice(self) -> Option<Resolution> {
        match self {
            ConflictStrategy::Manual => None,
            ConflictStrategy::PreferLocal => Some(Resolution::Local),
            ConflictStrategy::PreferRemote => Some(Resolution::Remote),
            ConflictStrategy::Merge => Some(Resolution::Merge),
        }
    }
}

/// A local and a remote change that collide on the same entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub local_change: Change,
    pub remote_change: Change,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    /// When the conflict was detected.
    #[serde(default = "Utc::now")]
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    /// Pair two changes under a fresh conflict id.
    pub fn new(local_change: Change, remote_change: Change) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            local_change,
            remote_change,
            resolved: false,
            resolution: None,
            detected_at: Utc::now(),
        }
    }

    /// Entity both sides touch.
    pub fn key(&self) -> EntityKey {
        self.local_change.key()
    }
}

/// Weights used to order conflicts for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityPolicy {
    /// Base weight per entity type.
    pub weights: HashMap<String, u32>,
    /// Weight for entity types not in the table.
    pub default_weight: u32,
    /// Each full interval between the two timestamps lowers priority by one.
    pub decay_interval: Duration,
}

impl PriorityPolicy {
    /// Base weight of an entity type.
    pub fn weight(&self, entity_type: &str) -> u32 {
        self.weights
            .get(entity_type)
            .copied()
            .unwrap_or(self.default_weight)
    }
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        let weights = [
            ("trip", 10),
            ("budget", 8),
            ("expense", 6),
            ("profile", 4),
            ("user", 2),
        ]
        .into_iter()
        .map(|(ty, w)| (ty.to_string(), w))
        .collect();

        Self {
            weights,
            default_weight: 1,
            decay_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Field-wise merge where the remote side wins every leaf it carries.
///
/// Objects merge key by key, recursively. Any other remote value replaces
/// the local one. Keys only the local side has are kept.
pub fn merge_payloads(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Object(local_map), Value::Object(remote_map)) => {
            let mut merged = local_map.clone();
            for (key, remote_value) in remote_map {
                let value = match (merged.get(key), remote_value) {
                    (Some(local_value), Value::Object(_)) => merge_payloads(local_value, remote_value),
                    _ => remote_value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        (_, remote) => remote.clone(),
    }
}

/// Conflict detector and resolver.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    policy: PriorityPolicy,
}

impl ConflictResolver {
    /// Create a resolver ranking conflicts with `policy`.
    pub fn new(policy: PriorityPolicy) -> Self {
        Self { policy }
    }

    /// Two updates of the same entity made at different times.
    pub fn detect(&self, local: &Change, remote: &Change) -> bool {
        local.same_entity(remote)
            && local.kind == ChangeKind::Update
            && remote.kind == ChangeKind::Update
            && local.timestamp != remote.timestamp
    }

    /// Merge two payloads, remote winning per field.
    pub fn merge(&self, local: &Value, remote: &Value) -> Value {
        merge_payloads(local, remote)
    }

    /// Whether `choice` may settle `conflict`. Only update/update pairs merge.
    pub fn validate_choice(&self, conflict: &Conflict, choice: Resolution) -> bool {
        match choice {
            Resolution::Local | Resolution::Remote => true,
            Resolution::Merge => {
                conflict.local_change.kind == ChangeKind::Update
                    && conflict.remote_change.kind == ChangeKind::Update
            }
        }
    }

    /// Build the change that settles `conflict`.
    ///
    /// # Errors
    /// - `Merge` on a conflict that is not update/update
    pub fn resolve(&self, conflict: &Conflict, choice: Resolution) -> Result<Change> {
        if !self.validate_choice(conflict, choice) {
            return Err(Error::InvalidInput(format!(
                "Conflict {} ({} vs {}) cannot be merged; choose local or remote",
                conflict.id, conflict.local_change.kind, conflict.remote_change.kind
            )));
        }

        match choice {
            Resolution::Local => Ok(conflict.local_change.clone()),
            Resolution::Remote => Ok(conflict.remote_change.clone()),
            Resolution::Merge => {
                let local = &conflict.local_change;
                Ok(Change {
                    id: Uuid::new_v4().to_string(),
                    kind: ChangeKind::Update,
                    entity_type: local.entity_type.clone(),
                    entity_id: local.entity_id.clone(),
                    payload: self.merge(&local.payload, &conflict.remote_change.payload),
                    timestamp: Utc::now(),
                    origin_device: local.origin_device.clone(),
                    version: local.version,
                })
            }
        }
    }

    /// Urgency of a conflict, at least 1. Used for ordering only.
    pub fn priority(&self, conflict: &Conflict) -> u32 {
        let base = self.policy.weight(&conflict.local_change.entity_type);

        let gap = (conflict.local_change.timestamp - conflict.remote_change.timestamp)
            .num_milliseconds()
            .unsigned_abs();
        let interval = self.policy.decay_interval.as_millis();
        let steps = if interval == 0 {
            0
        } else {
            u32::try_from(u128::from(gap) / interval).unwrap_or(u32::MAX)
        };

        base.saturating_sub(steps).max(1)
    }

    /// Conflicts ordered by descending priority; ties keep their order.
    pub fn rank(&self, conflicts: &[Conflict]) -> Vec<(u32, Conflict)> {
        let mut ranked: Vec<(u32, Conflict)> = conflicts
            .iter()
            .map(|c| (self.priority(c), c.clone()))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        ranked
    }

    /// Get the priority policy.
    pub fn policy(&self) -> &PriorityPolicy {
        &self.policy
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(PriorityPolicy::default())
    }
}
