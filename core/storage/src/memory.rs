//! In-memory record store for testing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::provider::{validate_record_name, RecordStore};
use wayfarer_common::{Error, Result};

/// In-memory record store.
///
/// Useful for testing and development. All data is stored in memory and
/// lost on drop. Clones share the same records, which lets a test reopen
/// an offline store over the "same disk".
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    records: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryRecordStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Check if no records are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> Error {
        Error::Storage("Memory store lock poisoned".to_string())
    }
}

impl RecordStore for MemoryRecordStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn load(&self, record: &str) -> Result<Option<Vec<u8>>> {
        validate_record_name(record)?;
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records.get(record).cloned())
    }

    fn save(&self, record: &str, data: &[u8]) -> Result<()> {
        validate_record_name(record)?;
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        records.insert(record.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&self, record: &str) -> Result<()> {
        validate_record_name(record)?;
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        records.remove(record);
        Ok(())
    }
}
