//! Per-index cache of opened source stores.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{KvEngine, KvEngineKind, RedbOptions};
use crate::error::{Result, StorageError};

/// Directory under the data root holding every index's source store.
pub const SOURCE_STORAGE_DIR: &str = "_storage";

/// One opened [`KvEngine`] per index name.
///
/// Lookups take the shared lock; a miss upgrades to the exclusive lock and
/// re-checks before opening, so concurrent first accesses open the store once.
pub struct SourceStoreRegistry {
    data_root: PathBuf,
    kind: KvEngineKind,
    options: RedbOptions,
    engines: RwLock<HashMap<String, Arc<dyn KvEngine>>>,
}

impl SourceStoreRegistry {
    pub fn new(data_root: impl Into<PathBuf>, kind: KvEngineKind, options: RedbOptions) -> Self {
        Self {
            data_root: data_root.into(),
            kind,
            options,
            engines: RwLock::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> KvEngineKind {
        self.kind
    }

    /// `{data_root}/_storage/{index}`.
    pub fn source_dir(&self, index: &str) -> PathBuf {
        source_dir(&self.data_root, index)
    }

    /// Return the store for `index`, opening it on first use.
    pub fn get_or_open(&self, index: &str) -> Result<Arc<dyn KvEngine>> {
        if index.is_empty() {
            return Err(StorageError::Config("empty index name".to_string()));
        }
        if let Some(engine) = self.engines.read().get(index) {
            return Ok(engine.clone());
        }

        let mut engines = self.engines.write();
        if let Some(engine) = engines.get(index) {
            return Ok(engine.clone());
        }
        let dir = self.source_dir(index);
        let engine = self.kind.open(&dir, &self.options)?;
        info!(index, engine = self.kind.as_str(), path = %dir.display(), "opened source store");
        engines.insert(index.to_string(), engine.clone());
        Ok(engine)
    }

    /// Whether a store for `index` is currently open.
    pub fn contains(&self, index: &str) -> bool {
        self.engines.read().contains_key(index)
    }

    /// Close and evict the store for `index`. Returns whether one was open.
    pub fn delete_index(&self, index: &str) -> Result<bool> {
        let engine = self.engines.write().remove(index);
        match engine {
            Some(engine) => {
                engine.close()?;
                debug!(index, "closed source store");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every cached store. Failures are logged and the first one returned.
    pub fn close_all(&self) -> Result<()> {
        let drained: Vec<_> = self.engines.write().drain().collect();
        info!(count = drained.len(), "closing source stores");
        let mut first_err = None;
        for (index, engine) in drained {
            if let Err(e) = engine.close() {
                warn!(index = %index, error = %e, "failed to close source store");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// `{data_root}/_storage/{index}`.
pub fn source_dir(data_root: &Path, index: &str) -> PathBuf {
    data_root.join(SOURCE_STORAGE_DIR).join(index)
}

impl std::fmt::Debug for SourceStoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceStoreRegistry")
            .field("data_root", &self.data_root)
            .field("kind", &self.kind)
            .field("open", &self.engines.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir, kind: KvEngineKind) -> SourceStoreRegistry {
        SourceStoreRegistry::new(dir.path(), kind, RedbOptions::default())
    }

    #[test]
    fn test_get_or_open_caches_per_index() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, KvEngineKind::Redb);

        let a1 = registry.get_or_open("a").unwrap();
        let a2 = registry.get_or_open("a").unwrap();
        let b = registry.get_or_open("b").unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert!(dir.path().join("_storage").join("a").join("source.redb").exists());
    }

    #[test]
    fn test_concurrent_first_open_yields_one_handle() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, KvEngineKind::Sqlite);

        let handles: Vec<Arc<dyn KvEngine>> = std::thread::scope(|s| {
            let joins: Vec<_> = (0..8)
                .map(|_| s.spawn(|| registry.get_or_open("shared").unwrap()))
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });
        for h in &handles[1..] {
            assert!(Arc::ptr_eq(&handles[0], h));
        }
    }

    #[test]
    fn test_delete_index_closes_and_evicts() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, KvEngineKind::Redb);
        let engine = registry.get_or_open("logs").unwrap();
        engine.set("logs/1", b"{}").unwrap();

        assert!(registry.delete_index("logs").unwrap());
        assert!(!registry.contains("logs"));
        assert!(matches!(engine.get("logs/1").unwrap_err(), StorageError::Closed(_)));
        assert!(!registry.delete_index("logs").unwrap());

        let reopened = registry.get_or_open("logs").unwrap();
        assert_eq!(reopened.get("logs/1").unwrap(), b"{}");
    }

    #[test]
    fn test_empty_index_name_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, KvEngineKind::Redb);
        assert!(matches!(
            registry.get_or_open("").err().unwrap(),
            StorageError::Config(_)
        ));
    }
}
