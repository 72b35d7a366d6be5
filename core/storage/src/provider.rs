//! Record store trait definition.

use wayfarer_common::{Error, Result};

/// Durable storage for named, opaque records.
///
/// A record is read and written as a whole. Implementations must make
/// `save` all-or-nothing: after a crash a reader sees either the previous
/// record or the new one, never a mix.
pub trait RecordStore: Send + Sync {
    /// Get the backend name (e.g., "local", "memory").
    fn name(&self) -> &str;

    /// Load a record.
    ///
    /// # Returns
    /// `Ok(None)` when no record with that name was ever saved.
    fn load(&self, record: &str) -> Result<Option<Vec<u8>>>;

    /// Replace a record with `data`.
    ///
    /// # Postconditions
    /// - A following `load` returns exactly `data`
    fn save(&self, record: &str, data: &[u8]) -> Result<()>;

    /// Remove a record. Removing a missing record is not an error.
    fn remove(&self, record: &str) -> Result<()>;

    /// Check if a record exists.
    fn exists(&self, record: &str) -> Result<bool> {
        Ok(self.load(record)?.is_some())
    }
}

/// Check that a record name is usable by every backend.
///
/// # Errors
/// - Empty names, path separators, or leading dots
pub fn validate_record_name(record: &str) -> Result<()> {
    if record.is_empty() {
        return Err(Error::InvalidInput("Record name cannot be empty".to_string()));
    }
    if record.contains('/') || record.contains('\\') {
        return Err(Error::InvalidInput(format!(
            "Record name cannot contain separators: {}",
            record
        )));
    }
    if record.starts_with('.') {
        return Err(Error::InvalidInput(format!(
            "Record name cannot start with a dot: {}",
            record
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_name_validation() {
        assert!(validate_record_name("offline_queue").is_ok());
        assert!(validate_record_name("").is_err());
        assert!(validate_record_name("a/b").is_err());
        assert!(validate_record_name("..\\x").is_err());
        assert!(validate_record_name(".hidden").is_err());
    }
}
