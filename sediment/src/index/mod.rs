//! Indexes: metadata, writer/reader lifecycle and source documents.

mod handles;
mod manager;

pub use handles::{SegmentMeta, SegmentReader, SegmentWriter, SEGMENT_KIND, SNAPSHOT_KIND};
pub use manager::IndexManager;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use sediment_storage::{
    source_key, DirectoryFactory, KvEngine, SourceStoreRegistry, StorageType,
};

use crate::analysis::{AnalysisSettings, Analyzer, AnalyzerSet};
use crate::error::{Error, Result};

/// Index settings owned by the metadata store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSettings {
    #[serde(default)]
    pub analysis: Option<AnalysisSettings>,
}

/// Persisted description of an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub name: String,
    #[serde(default)]
    pub storage_type: Option<StorageType>,
    #[serde(default)]
    pub settings: IndexSettings,
    #[serde(default)]
    pub mappings: Option<Value>,
}

impl IndexMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage_type: None,
            settings: IndexSettings::default(),
            mappings: None,
        }
    }

    pub fn with_storage_type(mut self, storage_type: StorageType) -> Self {
        self.storage_type = Some(storage_type);
        self
    }

    pub fn with_settings(mut self, settings: IndexSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Source of index metadata at startup.
pub trait IndexCatalog {
    fn list(&self) -> Result<Vec<IndexMeta>>;
}

impl IndexCatalog for Vec<IndexMeta> {
    fn list(&self) -> Result<Vec<IndexMeta>> {
        Ok(self.clone())
    }
}

fn build_analyzers(name: &str, settings: &IndexSettings) -> Result<Option<Arc<AnalyzerSet>>> {
    match &settings.analysis {
        Some(analysis) => {
            let set = AnalyzerSet::build(analysis).map_err(|e| {
                Error::Analysis(format!("index [{}] parse stored analysis error: {}", name, e))
            })?;
            Ok(Some(Arc::new(set)))
        }
        None => Ok(None),
    }
}

/// One index held in memory.
///
/// The writer slot is guarded by one lock: readers of an open writer share
/// it, while opening, reopening or closing the writer takes it exclusively.
pub struct Index {
    name: String,
    storage_type: StorageType,
    settings: RwLock<IndexSettings>,
    mappings: RwLock<Option<Value>>,
    analyzers: RwLock<Option<Arc<AnalyzerSet>>>,
    writer: RwLock<Option<Arc<SegmentWriter>>>,
    directories: DirectoryFactory,
    sources: Arc<SourceStoreRegistry>,
    batch_size: usize,
    storage_size: AtomicU64,
}

impl Index {
    /// Build an index from its metadata, validating its analyzers.
    pub fn new(
        meta: IndexMeta,
        default_storage_type: StorageType,
        directories: DirectoryFactory,
        sources: Arc<SourceStoreRegistry>,
        batch_size: usize,
    ) -> Result<Self> {
        let analyzers = build_analyzers(&meta.name, &meta.settings)?;
        Ok(Self {
            storage_type: meta.storage_type.unwrap_or(default_storage_type),
            name: meta.name,
            settings: RwLock::new(meta.settings),
            mappings: RwLock::new(meta.mappings),
            analyzers: RwLock::new(analyzers),
            writer: RwLock::new(None),
            directories,
            sources,
            batch_size: batch_size.max(1),
            storage_size: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn settings(&self) -> IndexSettings {
        self.settings.read().clone()
    }

    pub fn mappings(&self) -> Option<Value> {
        self.mappings.read().clone()
    }

    pub fn set_mappings(&self, mappings: Option<Value>) {
        *self.mappings.write() = mappings;
    }

    /// Current metadata, e.g. for persisting back to the catalog.
    pub fn meta(&self) -> IndexMeta {
        IndexMeta {
            name: self.name.clone(),
            storage_type: Some(self.storage_type),
            settings: self.settings(),
            mappings: self.mappings(),
        }
    }

    pub fn analyzers(&self) -> Option<Arc<AnalyzerSet>> {
        self.analyzers.read().clone()
    }

    pub fn default_analyzer(&self) -> Option<Arc<Analyzer>> {
        self.analyzers
            .read()
            .as_ref()
            .and_then(|set| set.default_analyzer())
    }

    /// Replace settings, rebuilding the analyzer cache.
    ///
    /// Nothing changes if the new analysis settings are invalid. An open
    /// writer keeps its old analyzer until [`Index::reopen`].
    pub fn set_settings(&self, settings: IndexSettings) -> Result<()> {
        let analyzers = build_analyzers(&self.name, &settings)?;
        *self.analyzers.write() = analyzers;
        *self.settings.write() = settings;
        Ok(())
    }

    fn open_writer(&self) -> Result<Arc<SegmentWriter>> {
        let directory = self.directories.directory(&self.name, self.storage_type);
        let writer = SegmentWriter::open(&self.name, directory, self.default_analyzer())
            .map_err(|e| Error::open(&self.name, "open writer", e))?;
        Ok(Arc::new(writer))
    }

    /// The index writer, opened on first use and reused until closed.
    pub fn get_writer(&self) -> Result<Arc<SegmentWriter>> {
        if let Some(writer) = self.writer.read().as_ref() {
            return Ok(writer.clone());
        }

        let mut slot = self.writer.write();
        if let Some(writer) = slot.as_ref() {
            return Ok(writer.clone());
        }
        let writer = self.open_writer()?;
        *slot = Some(writer.clone());
        Ok(writer)
    }

    pub fn has_writer(&self) -> bool {
        self.writer.read().is_some()
    }

    /// A reader over `[time_min, time_max]` (`0` leaves a bound open).
    ///
    /// Served from the open writer when there is one (covering every live
    /// segment); otherwise a fresh historical reader is opened and handed
    /// over without being cached.
    pub fn get_reader(&self, time_min: i64, time_max: i64) -> Result<SegmentReader> {
        if let Some(writer) = self.writer.read().as_ref() {
            return writer
                .reader()
                .map_err(|e| Error::open(&self.name, "open reader", e));
        }

        let slot = self.writer.write();
        if let Some(writer) = slot.as_ref() {
            return writer
                .reader()
                .map_err(|e| Error::open(&self.name, "open reader", e));
        }
        let directory = self.directories.directory(&self.name, self.storage_type);
        SegmentReader::open_historical(
            &self.name,
            directory,
            self.default_analyzer(),
            time_min,
            time_max,
        )
        .map_err(|e| Error::open(&self.name, "open reader", e))
    }

    /// Close the current writer, if any, and open a new one.
    pub fn reopen(&self) -> Result<Arc<SegmentWriter>> {
        let mut slot = self.writer.write();
        if let Some(old) = slot.take() {
            old.close()
                .map_err(|e| Error::open(&self.name, "close writer", e))?;
        }
        let writer = self.open_writer()?;
        *slot = Some(writer.clone());
        info!(index = %self.name, "reopened index writer");
        Ok(writer)
    }

    /// Close and drop the writer. Returns whether one was open.
    pub fn close_writer(&self) -> Result<bool> {
        let writer = self.writer.write().take();
        match writer {
            Some(writer) => {
                writer
                    .close()
                    .map_err(|e| Error::open(&self.name, "close writer", e))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Segment count and bytes as reported by the directory, also cached as
    /// the index storage size.
    pub fn segment_stats(&self) -> (u64, u64) {
        let writer = self.writer.read().clone();
        let stats = match writer {
            Some(writer) => writer.directory().stats(),
            None => {
                let directory = self.directories.directory(&self.name, self.storage_type);
                match directory.setup(true) {
                    Ok(()) => {
                        let stats = directory.stats();
                        if let Err(e) = directory.close() {
                            debug!(index = %self.name, "failed to close stats directory: {}", e);
                        }
                        stats
                    }
                    Err(e) => {
                        debug!(index = %self.name, "no segment storage yet: {}", e);
                        (0, 0)
                    }
                }
            }
        };
        self.storage_size.store(stats.1, Ordering::Relaxed);
        stats
    }

    /// Storage size in bytes as of the last [`Index::segment_stats`].
    pub fn storage_size(&self) -> u64 {
        self.storage_size.load(Ordering::Relaxed)
    }

    fn source_store(&self) -> Result<Arc<dyn KvEngine>> {
        Ok(self.sources.get_or_open(&self.name)?)
    }

    /// Store the original body of a document.
    pub fn set_source_data(&self, doc_id: &str, doc: &Value) -> Result<()> {
        let body = serde_json::to_vec(doc)?;
        self.source_store()?
            .set(&source_key(&self.name, doc_id), &body)?;
        Ok(())
    }

    pub fn get_source_data(&self, doc_id: &str) -> Result<Value> {
        let body = self.source_store()?.get(&source_key(&self.name, doc_id))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Fetch several documents. Fails if any of them is missing.
    pub fn get_source_datas(&self, doc_ids: &[String]) -> Result<HashMap<String, Value>> {
        let keys: Vec<String> = doc_ids
            .iter()
            .map(|id| source_key(&self.name, id))
            .collect();
        let mut bodies = self.source_store()?.gets(&keys)?;

        let mut docs = HashMap::with_capacity(doc_ids.len());
        for (doc_id, key) in doc_ids.iter().zip(&keys) {
            if let Some(body) = bodies.remove(key) {
                docs.insert(doc_id.clone(), serde_json::from_slice(&body)?);
            }
        }
        Ok(docs)
    }

    pub fn delete_source_data(&self, doc_id: &str) -> Result<()> {
        self.source_store()?
            .delete(&source_key(&self.name, doc_id))?;
        Ok(())
    }

    /// Store many documents, committing every `batch_size` of them.
    ///
    /// Returns the number of documents written.
    pub fn bulk_set_source_data<I>(&self, docs: I) -> Result<usize>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let engine = self.source_store()?;
        let mut batch = engine.bulk(true)?;
        let mut pending = 0usize;
        let mut total = 0usize;

        for (doc_id, doc) in docs {
            let body = serde_json::to_vec(&doc)?;
            batch.set(&source_key(&self.name, &doc_id), &body)?;
            pending += 1;
            total += 1;
            if pending >= self.batch_size {
                batch.commit()?;
                batch = engine.bulk(true)?;
                pending = 0;
            }
        }
        batch.commit()?;

        debug!(index = %self.name, docs = total, "bulk stored source documents");
        Ok(total)
    }

    /// Close the writer, logging rather than returning failures.
    pub(crate) fn shutdown(&self) {
        if let Err(e) = self.close_writer() {
            warn!(index = %self.name, "failed to close writer: {}", e);
        }
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("storage_type", &self.storage_type)
            .field("writer_open", &self.has_writer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalyzerDef;
    use sediment_storage::{
        CancellationToken, CompressionAlgorithm, KvEngineKind, KvHandleRegistry, RedbOptions,
    };
    use serde_json::json;
    use tempfile::TempDir;

    fn index(dir: &TempDir, meta: IndexMeta, batch_size: usize) -> Index {
        let directories = DirectoryFactory::new(
            dir.path(),
            CompressionAlgorithm::Snappy,
            Arc::new(KvHandleRegistry::new()),
        );
        let sources = Arc::new(SourceStoreRegistry::new(
            dir.path(),
            KvEngineKind::Redb,
            RedbOptions::default(),
        ));
        Index::new(meta, StorageType::Disk, directories, sources, batch_size).unwrap()
    }

    fn analysis(tokenizer: &str) -> IndexSettings {
        let mut analysis = AnalysisSettings::default();
        analysis.analyzers.insert(
            "default".to_string(),
            AnalyzerDef {
                tokenizer: tokenizer.to_string(),
                filters: vec!["lowercase".to_string()],
            },
        );
        IndexSettings {
            analysis: Some(analysis),
        }
    }

    #[test]
    fn test_writer_is_reused() {
        let dir = TempDir::new().unwrap();
        let idx = index(&dir, IndexMeta::new("logs"), 10);
        let a = idx.get_writer().unwrap();
        let b = idx.get_writer().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(idx.close_writer().unwrap());
        assert!(!idx.close_writer().unwrap());
    }

    #[test]
    fn test_reader_from_writer_vs_historical() {
        let dir = TempDir::new().unwrap();
        let idx = index(&dir, IndexMeta::new("logs"), 10);

        let writer = idx.get_writer().unwrap();
        writer
            .add_segment(&b"seg".to_vec(), 5, 9, &CancellationToken::new())
            .unwrap();
        let live = idx.get_reader(100, 200).unwrap();
        assert!(live.is_live());
        assert_eq!(live.segments().len(), 1);
        drop(live);

        idx.close_writer().unwrap();
        let historical = idx.get_reader(100, 200).unwrap();
        assert!(!historical.is_live());
        assert!(historical.segments().is_empty());
        assert!(!idx.has_writer());
    }

    #[test]
    fn test_default_analyzer_passed_to_writer() {
        let dir = TempDir::new().unwrap();
        let idx = index(
            &dir,
            IndexMeta::new("logs").with_settings(analysis("whitespace")),
            10,
        );
        let writer = idx.get_writer().unwrap();
        assert_eq!(writer.analyzer().unwrap().name(), "default");
    }

    #[test]
    fn test_invalid_settings_leave_index_unchanged() {
        let dir = TempDir::new().unwrap();
        let idx = index(
            &dir,
            IndexMeta::new("logs").with_settings(analysis("standard")),
            10,
        );
        let err = idx.set_settings(analysis("bogus")).unwrap_err();
        assert!(matches!(err, Error::Analysis(_)));
        assert_eq!(idx.settings(), analysis("standard"));
        assert!(idx.default_analyzer().is_some());
    }

    #[test]
    fn test_source_documents() {
        let dir = TempDir::new().unwrap();
        let idx = index(&dir, IndexMeta::new("logs"), 10);

        idx.set_source_data("1", &json!({"msg": "hello"})).unwrap();
        idx.set_source_data("2", &json!({"msg": "world"})).unwrap();
        assert_eq!(idx.get_source_data("1").unwrap(), json!({"msg": "hello"}));

        let docs = idx
            .get_source_datas(&["1".to_string(), "2".to_string()])
            .unwrap();
        assert_eq!(docs["2"], json!({"msg": "world"}));
        assert!(idx
            .get_source_datas(&["1".to_string(), "3".to_string()])
            .unwrap_err()
            .is_not_found());

        idx.delete_source_data("1").unwrap();
        assert!(idx.get_source_data("1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_bulk_set_commits_in_batches() {
        let dir = TempDir::new().unwrap();
        let idx = index(&dir, IndexMeta::new("logs"), 3);
        let docs = (0..10).map(|i| (i.to_string(), json!({ "n": i })));
        assert_eq!(idx.bulk_set_source_data(docs).unwrap(), 10);
        for i in 0..10 {
            assert_eq!(idx.get_source_data(&i.to_string()).unwrap(), json!({ "n": i }));
        }
    }

    #[test]
    fn test_segment_stats_without_writer() {
        let dir = TempDir::new().unwrap();
        let idx = index(&dir, IndexMeta::new("logs"), 10);
        assert_eq!(idx.segment_stats(), (0, 0));

        let writer = idx.get_writer().unwrap();
        writer
            .add_segment(&vec![1u8; 512], 0, 0, &CancellationToken::new())
            .unwrap();
        idx.close_writer().unwrap();

        let (count, bytes) = idx.segment_stats();
        // One data segment plus one snapshot.
        assert_eq!(count, 2);
        assert!(bytes > 0);
        assert_eq!(idx.storage_size(), bytes);
    }
}
