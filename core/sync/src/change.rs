//! Change records: the unit of work the sync engine moves around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use wayfarer_common::EntityKey;

/// Kind of mutation a change carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Entity was created.
    Create,
    /// Existing entity was modified.
    Update,
    /// Entity was deleted.
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = wayfarer_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeKind::Create),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(wayfarer_common::Error::InvalidInput(format!(
                "Unknown change kind: {}",
                other
            ))),
        }
    }
}

/// An atomic mutation of one entity.
///
/// Changes are immutable once created. Resolving a conflict produces a new
/// change instead of editing either side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Unique ID for this change.
    pub id: String,
    /// Type of change.
    pub kind: ChangeKind,
    /// Entity tag, e.g. "trip" or "expense".
    pub entity_type: String,
    /// Identifier of the entity within its type.
    pub entity_id: String,
    /// Opaque structured body.
    pub payload: serde_json::Value,
    /// Wall-clock time the change was made.
    pub timestamp: DateTime<Utc>,
    /// Device the change was made on.
    pub origin_device: String,
    /// Queue version at the time the change was recorded. Informational.
    pub version: u64,
}

impl Change {
    /// Key of the entity this change applies to.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Check whether `other` targets the same entity.
    pub fn same_entity(&self, other: &Change) -> bool {
        self.entity_type == other.entity_type && self.entity_id == other.entity_id
    }

    /// Check that every identity field is filled in.
    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }

    /// Names of the identity fields that are blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.id.trim().is_empty() {
            missing.push("id");
        }
        if self.entity_type.trim().is_empty() {
            missing.push("entityType");
        }
        if self.entity_id.trim().is_empty() {
            missing.push("entityId");
        }
        if self.origin_device.trim().is_empty() {
            missing.push("originDevice");
        }
        missing
    }
}

/// The caller-supplied part of a change.
///
/// The offline store fills in id, timestamp, device and version when the
/// change is queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChange {
    pub kind: ChangeKind,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
}

impl NewChange {
    /// Describe a mutation of one entity.
    pub fn new(
        kind: ChangeKind,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload,
        }
    }

    pub fn create(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(ChangeKind::Create, entity_type, entity_id, payload)
    }

    pub fn update(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(ChangeKind::Update, entity_type, entity_id, payload)
    }

    pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(ChangeKind::Delete, entity_type, entity_id, serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Change {
        Change {
            id: "c1".to_string(),
            kind: ChangeKind::Update,
            entity_type: "trip".to_string(),
            entity_id: "t1".to_string(),
            payload: json!({"title": "Lisbon"}),
            timestamp: Utc::now(),
            origin_device: "phone".to_string(),
            version: 1,
        }
    }

    #[test]
    fn test_complete_change() {
        assert!(sample().is_complete());
    }

    #[test]
    fn test_missing_fields_reported() {
        let mut change = sample();
        change.entity_id = String::new();
        change.origin_device = " ".to_string();
        assert!(!change.is_complete());
        assert_eq!(change.missing_fields(), vec!["entityId", "originDevice"]);
    }

    #[test]
    fn test_wire_field_names() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["kind"], "update");
        assert_eq!(value["entityType"], "trip");
        assert_eq!(value["originDevice"], "phone");
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("delete".parse::<ChangeKind>().unwrap(), ChangeKind::Delete);
        assert!("upsert".parse::<ChangeKind>().is_err());
    }
}
