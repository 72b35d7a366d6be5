//! Common types used throughout Wayfarer.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of the device that owns an offline queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new DeviceId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or only whitespace
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "DeviceId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random device identifier.
    pub fn generate() -> Self {
        Self(format!("device-{}", Uuid::new_v4()))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `(entity type, entity id)` pair a change applies to.
///
/// Two changes with the same key touch the same logical record, which is
/// what de-duplication and conflict detection compare on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    /// Create a key from its parts.
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Parse a `type/id` string.
    ///
    /// # Errors
    /// - Missing separator or an empty half
    pub fn parse(key: &str) -> crate::Result<Self> {
        match key.split_once('/') {
            Some((entity_type, entity_id)) if !entity_type.is_empty() && !entity_id.is_empty() => {
                Ok(Self::new(entity_type, entity_id))
            }
            _ => Err(crate::Error::InvalidInput(format!(
                "Entity key must look like type/id: {}",
                key
            ))),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}
