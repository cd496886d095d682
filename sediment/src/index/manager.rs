//! In-memory registry of indexes and their lifecycle.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use sediment_storage::{
    DirectoryFactory, SourceStoreRegistry, StorageType, SEGMENTS_FILENAME,
};

use super::{Index, IndexCatalog, IndexMeta, IndexSettings, SegmentReader, SegmentWriter};
use crate::error::{Error, Result};

/// Every index known to the process, keyed by name.
pub struct IndexManager {
    directories: DirectoryFactory,
    sources: Arc<SourceStoreRegistry>,
    default_storage_type: StorageType,
    batch_size: usize,
    indexes: RwLock<HashMap<String, Arc<Index>>>,
}

impl IndexManager {
    pub fn new(
        directories: DirectoryFactory,
        sources: Arc<SourceStoreRegistry>,
        default_storage_type: StorageType,
        batch_size: usize,
    ) -> Self {
        Self {
            directories,
            sources,
            default_storage_type,
            batch_size,
            indexes: RwLock::new(HashMap::new()),
        }
    }

    fn build(&self, meta: IndexMeta) -> Result<Index> {
        Index::new(
            meta,
            self.default_storage_type,
            self.directories.clone(),
            self.sources.clone(),
            self.batch_size,
        )
    }

    /// Load every index listed by `catalog`.
    ///
    /// The first index whose analysis settings fail to build aborts the load.
    /// Returns the number of indexes loaded.
    pub fn load_from_catalog(&self, catalog: &dyn IndexCatalog) -> Result<usize> {
        let metas = catalog.list()?;
        let mut loaded = 0;
        for meta in metas {
            info!(index = %meta.name, storage_type = ?meta.storage_type, "Loading index...");
            let index = Arc::new(self.build(meta)?);
            index.segment_stats();
            self.indexes
                .write()
                .insert(index.name().to_string(), index);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Register a new index.
    pub fn create_index(&self, meta: IndexMeta) -> Result<Arc<Index>> {
        if meta.name.is_empty() || meta.name.starts_with('_') || meta.name.contains(['/', '\\']) {
            return Err(Error::Config(format!("invalid index name [{}]", meta.name)));
        }
        let mut indexes = self.indexes.write();
        if indexes.contains_key(&meta.name) {
            return Err(Error::IndexAlreadyExists(meta.name));
        }
        let index = Arc::new(self.build(meta)?);
        indexes.insert(index.name().to_string(), index.clone());
        info!(index = %index.name(), storage_type = %index.storage_type(), "created index");
        Ok(index)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Index>> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.indexes.read().contains_key(name)
    }

    /// All indexes, sorted by name.
    pub fn list(&self) -> Vec<Arc<Index>> {
        let mut indexes: Vec<_> = self.indexes.read().values().cloned().collect();
        indexes.sort_by(|a, b| a.name().cmp(b.name()));
        indexes
    }

    pub fn get_writer(&self, name: &str) -> Result<Arc<SegmentWriter>> {
        self.get(name)?.get_writer()
    }

    pub fn get_reader(&self, name: &str, time_min: i64, time_max: i64) -> Result<SegmentReader> {
        self.get(name)?.get_reader(time_min, time_max)
    }

    pub fn reopen(&self, name: &str) -> Result<Arc<SegmentWriter>> {
        self.get(name)?.reopen()
    }

    pub fn close_writer(&self, name: &str) -> Result<bool> {
        self.get(name)?.close_writer()
    }

    /// Replace an index's settings and reopen its writer, if one is open, so
    /// it picks up the new analyzers.
    pub fn update_settings(&self, name: &str, settings: IndexSettings) -> Result<()> {
        let index = self.get(name)?;
        index.set_settings(settings)?;
        if index.has_writer() {
            index.reopen()?;
        }
        Ok(())
    }

    /// Segment count and bytes of an index.
    pub fn segment_stats(&self, name: &str) -> Result<(u64, u64)> {
        Ok(self.get(name)?.segment_stats())
    }

    /// Forget an index and delete all of its data.
    pub fn delete_index(&self, name: &str) -> Result<()> {
        let index = self
            .indexes
            .write()
            .remove(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;

        index.close_writer()?;
        self.sources.delete_index(name)?;

        let segments_dir = self.directories.index_path(name);
        if index.storage_type() == StorageType::Kv {
            self.directories
                .kv_handles()
                .evict(&segments_dir.join(SEGMENTS_FILENAME));
        }
        remove_dir_if_exists(&segments_dir)?;
        remove_dir_if_exists(&self.sources.source_dir(name))?;

        info!(index = name, "deleted index");
        Ok(())
    }

    /// Close every open writer. Indexes stay registered.
    pub fn close_all(&self) {
        let indexes = self.list();
        info!(count = indexes.len(), "closing index writers");
        for index in indexes {
            index.shutdown();
        }
    }

    pub fn len(&self) -> usize {
        self.indexes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.read().is_empty()
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = %path.display(), "failed to remove index data: {}", e);
            Err(e.into())
        }
    }
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("indexes", &self.len())
            .field("default_storage_type", &self.default_storage_type)
            .finish()
    }
}
