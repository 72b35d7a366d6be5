//! Applying pulled remote changes to local application state.

use std::collections::HashMap;
use std::sync::RwLock;

use wayfarer_common::{EntityKey, Error, Result};

use crate::change::{Change, ChangeKind};
use crate::conflict::merge_payloads;

/// Writes remote changes into whatever holds the app's local data.
pub trait ChangeApplier: Send + Sync {
    /// Apply one change. Must be idempotent: the same change may arrive twice.
    fn apply(&self, change: &Change) -> Result<()>;
}

/// Local entity cache kept in memory.
///
/// Creates insert, updates merge into the existing payload, deletes remove.
#[derive(Debug, Default)]
pub struct MemoryApplier {
    entities: RwLock<HashMap<EntityKey, serde_json::Value>>,
    applied: RwLock<Vec<String>>,
}

impl MemoryApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current payload of an entity.
    pub fn get(&self, key: &EntityKey) -> Option<serde_json::Value> {
        self.entities.read().ok()?.get(key).cloned()
    }

    /// Ids of every change applied, in order.
    pub fn applied_ids(&self) -> Vec<String> {
        self.applied.read().map(|a| a.clone()).unwrap_or_default()
    }

    /// Number of entities currently held.
    pub fn len(&self) -> usize {
        self.entities.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChangeApplier for MemoryApplier {
    fn apply(&self, change: &Change) -> Result<()> {
        let poisoned = || Error::Storage("Local entity cache lock poisoned".to_string());
        let mut entities = self.entities.write().map_err(|_| poisoned())?;
        let key = change.key();

        match change.kind {
            ChangeKind::Create => {
                entities.insert(key, change.payload.clone());
            }
            ChangeKind::Update => {
                let merged = match entities.get(&key) {
                    Some(existing) => merge_payloads(existing, &change.payload),
                    None => change.payload.clone(),
                };
                entities.insert(key, merged);
            }
            ChangeKind::Delete => {
                entities.remove(&key);
            }
        }

        self.applied.write().map_err(|_| poisoned())?.push(change.id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn change(kind: ChangeKind, payload: serde_json::Value) -> Change {
        Change {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            entity_type: "expense".to_string(),
            entity_id: "e1".to_string(),
            payload,
            timestamp: Utc::now(),
            origin_device: "tablet".to_string(),
            version: 1,
        }
    }

    #[test]
    fn test_create_update_delete() {
        let applier = MemoryApplier::new();
        let key = EntityKey::new("expense", "e1");

        applier.apply(&change(ChangeKind::Create, json!({"amount": 12, "currency": "EUR"}))).unwrap();
        applier.apply(&change(ChangeKind::Update, json!({"amount": 15}))).unwrap();
        assert_eq!(applier.get(&key), Some(json!({"amount": 15, "currency": "EUR"})));

        applier.apply(&change(ChangeKind::Delete, serde_json::Value::Null)).unwrap();
        assert!(applier.get(&key).is_none());
        assert_eq!(applier.applied_ids().len(), 3);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let applier = MemoryApplier::new();
        let update = change(ChangeKind::Update, json!({"amount": 3}));
        applier.apply(&update).unwrap();
        applier.apply(&update).unwrap();
        assert_eq!(applier.len(), 1);
        assert_eq!(applier.get(&EntityKey::new("expense", "e1")), Some(json!({"amount": 3})));
    }
}
