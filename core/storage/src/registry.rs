//! Store registry for resolving a record store backend by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::RecordStore;
use wayfarer_common::{Error, Result};

/// Factory function type for creating record stores.
pub type StoreFactory = Box<dyn Fn(Value) -> Result<Arc<dyn RecordStore>> + Send + Sync>;

/// Registry for record store factories.
///
/// Lets configuration pick the persistence backend (`"local"` with a
/// `root` directory, `"memory"` for throwaway sessions) without the sync
/// engine knowing about either.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::Config(format!(
                "Store '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a store by name and configuration.
    ///
    /// # Errors
    /// - Store not registered
    /// - Configuration invalid for the store
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn RecordStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Store '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered store names.
    pub fn stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a store is registered.
    pub fn has_store(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in stores.
pub fn create_default_registry() -> StoreRegistry {
    let mut factories: HashMap<String, StoreFactory> = HashMap::new();

    factories.insert(
        "memory".to_string(),
        Box::new(|_config| Ok(Arc::new(crate::memory::MemoryRecordStore::new()))),
    );

    factories.insert(
        "local".to_string(),
        Box::new(|config| {
            let root = config
                .get("root")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Config("Local store requires 'root' path".to_string()))?;
            Ok(Arc::new(crate::local::LocalRecordStore::new(root)?))
        }),
    );

    StoreRegistry { factories }
}
