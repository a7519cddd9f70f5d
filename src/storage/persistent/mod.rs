//! Persistent storage backend.
//!
//! A store is a directory holding one period table per entity:
//! - File locking for single-process access
//! - CRC32 checksums for corruption detection
//! - Temp-file-then-rename writes for index files
//! - Tail truncation of blocks cut short by a crash
//!
//! ```text
//! <store>/.lock
//! <store>/<entity>/table.dat
//! <store>/<entity>/index/_<period>.idx
//! ```

mod codec;
mod file_lock;
mod table;

pub use file_lock::StoreLock;
pub use table::PersistentPeriodTable;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::schema::FieldDef;
use crate::storage::StorageError;

/// A locked store directory handing out per-entity tables.
#[derive(Debug, Clone)]
pub struct PersistentStore {
    root: PathBuf,
    config: StorageConfig,
    lock: Arc<StoreLock>,
}

impl PersistentStore {
    /// Opens (creating if needed) the store at `root` and locks it.
    ///
    /// # Errors
    /// - If the path cannot be created or accessed
    /// - If another process holds the lock
    pub fn open(root: &Path, config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(root)?;
        let lock = StoreLock::acquire(root).map_err(|e| {
            if e.kind() == ErrorKind::WouldBlock {
                StorageError::Locked(format!("{} ({e})", root.display()))
            } else {
                StorageError::Io(e)
            }
        })?;
        tracing::info!(root = %root.display(), "opened persistent store");
        Ok(Self {
            root: root.to_path_buf(),
            config,
            lock: Arc::new(lock),
        })
    }

    /// Directory holding the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Opens the table of `entity`, creating it with `fields` when absent.
    pub fn table(&self, entity: &str, fields: Vec<FieldDef>) -> Result<PersistentPeriodTable, StorageError> {
        PersistentPeriodTable::open_or_create(
            &self.root.join(entity),
            entity,
            fields,
            &self.config,
            Arc::clone(&self.lock),
        )
    }

    /// Opens the existing table of `entity`, `None` when it was never created.
    pub fn existing_table(&self, entity: &str) -> Result<Option<PersistentPeriodTable>, StorageError> {
        let dir = self.root.join(entity);
        if !dir.exists() {
            return Ok(None);
        }
        PersistentPeriodTable::open_existing(&dir, &self.config, Arc::clone(&self.lock)).map(Some)
    }
}

/// Opens a store, validating the storage configuration first.
pub fn open_store(root: impl AsRef<Path>, config: Option<StorageConfig>) -> crate::SimResult<PersistentStore> {
    let config = config.unwrap_or_default().validate()?;
    Ok(PersistentStore::open(root.as_ref(), config)?)
}
