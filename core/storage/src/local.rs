//! Local filesystem record store.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::provider::{validate_record_name, RecordStore};
use wayfarer_common::{Error, Result};

/// Local filesystem record store.
///
/// Each record is a `<name>.json` file under the root directory. Saves go
/// to a temporary sibling file that is synced and then renamed over the
/// record, so an interrupted save leaves the previous record intact.
pub struct LocalRecordStore {
    root: PathBuf,
}

impl LocalRecordStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, record: &str) -> PathBuf {
        self.root.join(format!("{}.json", record))
    }
}

impl RecordStore for LocalRecordStore {
    fn name(&self) -> &str {
        "local"
    }

    fn load(&self, record: &str) -> Result<Option<Vec<u8>>> {
        validate_record_name(record)?;
        match fs::read(self.record_path(record)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn save(&self, record: &str, data: &[u8]) -> Result<()> {
        validate_record_name(record)?;
        let target = self.record_path(record);
        let temp = self.root.join(format!(".{}.{}.tmp", record, Uuid::new_v4()));

        let write_result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&temp, &target)
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&temp);
            return Err(Error::Io(e));
        }

        debug!("Saved record {} ({} bytes)", record, data.len());
        Ok(())
    }

    fn remove(&self, record: &str) -> Result<()> {
        validate_record_name(record)?;
        match fs::remove_file(self.record_path(record)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
