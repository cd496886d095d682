//! Registry of opened KV directory databases.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use redb::Database;
use tracing::{debug, info};

use crate::error::{Result, StorageError};

/// Opened `redb` databases backing [`super::KvDirectory`] instances, keyed by file path.
///
/// A database file can only be opened once per process, so the writer and
/// any readers of the same index share the handle cached here. The registry
/// keeps every handle alive until it is evicted (index deletion) or
/// [`KvHandleRegistry::close_all`] runs at shutdown.
#[derive(Default)]
pub struct KvHandleRegistry {
    handles: Mutex<HashMap<PathBuf, Arc<Database>>>,
}

impl KvHandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached database for `path`, opening (or creating) it on first use.
    ///
    /// With `read_only` set, a missing database file is an error instead of
    /// being created.
    pub fn open(&self, path: &Path, read_only: bool) -> Result<Arc<Database>> {
        // Held across the open so two callers never race to open the same file.
        let mut handles = self.handles.lock();
        if let Some(db) = handles.get(path) {
            return Ok(db.clone());
        }

        let opened = if path.exists() {
            Database::open(path)
        } else if read_only {
            return Err(StorageError::Config(format!(
                "read-only open of missing KV directory {}",
                path.display()
            )));
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::io("setup", parent, e))?;
            }
            Database::create(path)
        };
        let db = opened
            .map_err(|e| StorageError::kv("directory.kv.open", &path.display().to_string(), e))?;

        debug!(path = %path.display(), "opened KV directory database");
        let db = Arc::new(db);
        handles.insert(path.to_path_buf(), db.clone());
        Ok(db)
    }

    /// Drop the registry's handle for `path`.
    ///
    /// The database closes once every directory holding it has closed too.
    pub fn evict(&self, path: &Path) -> bool {
        self.handles.lock().remove(path).is_some()
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Release every cached handle.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.handles.lock().drain().collect();
        info!(count = drained.len(), "closing KV directory databases");
        for (path, db) in drained {
            if Arc::strong_count(&db) > 1 {
                debug!(path = %path.display(), "KV directory database still referenced, closes on last drop");
            }
        }
    }
}

impl std::fmt::Debug for KvHandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvHandleRegistry")
            .field("open", &self.len())
            .finish()
    }
}
