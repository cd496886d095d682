//! Process-wide application context.

use std::fs;
use std::sync::Arc;

use tracing::info;

use sediment_storage::{DirectoryFactory, KvHandleRegistry, SourceStoreRegistry};

use crate::config::Config;
use crate::error::Result;
use crate::index::{IndexCatalog, IndexManager};

/// Owns every shared registry. Create one per process with [`Engine::open`]
/// and call [`Engine::shutdown`] before exit.
pub struct Engine {
    config: Config,
    kv_handles: Arc<KvHandleRegistry>,
    sources: Arc<SourceStoreRegistry>,
    indexes: IndexManager,
}

impl Engine {
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.data_path)?;

        let kv_handles = Arc::new(KvHandleRegistry::new());
        let directories = DirectoryFactory::new(
            &config.data_path,
            config.index_compress_algorithm,
            kv_handles.clone(),
        );
        let sources = Arc::new(SourceStoreRegistry::new(
            &config.data_path,
            config.source_storage_engine,
            config.redb_options(),
        ));
        let indexes = IndexManager::new(
            directories,
            sources.clone(),
            config.default_storage_type,
            config.batch_size,
        );

        info!(
            data_path = %config.data_path.display(),
            source_engine = %config.source_storage_engine,
            compression = %config.index_compress_algorithm,
            storage_type = %config.default_storage_type,
            "engine started"
        );
        Ok(Self {
            config,
            kv_handles,
            sources,
            indexes,
        })
    }

    /// Open and load every index listed by `catalog`.
    pub fn open_with_catalog(config: Config, catalog: &dyn IndexCatalog) -> Result<Self> {
        let engine = Self::open(config)?;
        let loaded = engine.indexes.load_from_catalog(catalog)?;
        info!(indexes = loaded, "loaded indexes from catalog");
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    pub fn sources(&self) -> &Arc<SourceStoreRegistry> {
        &self.sources
    }

    pub fn kv_handles(&self) -> &Arc<KvHandleRegistry> {
        &self.kv_handles
    }

    /// Close writers, then source stores, then KV directory handles.
    pub fn shutdown(&self) -> Result<()> {
        info!("shutting down");
        self.indexes.close_all();
        let sources = self.sources.close_all();
        self.kv_handles.close_all();
        sources?;
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_path", &self.config.data_path)
            .field("indexes", &self.indexes)
            .field("sources", &self.sources)
            .field("kv_handles", &self.kv_handles)
            .finish()
    }
}
