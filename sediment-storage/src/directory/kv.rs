//! Segment directory stored inside a single embedded KV database.
//!
//! Every segment is one entry of the `segments` table, keyed
//! `"{kind}:{id:012x}"`. Segments are buffered fully in memory and written
//! in a single transaction, so a failed persist never leaves a partial entry.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, Durability, ReadableTable, ReadableTableMetadata, TableDefinition};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::{buffer_source, decode_id, encode_id, KvHandleRegistry, LoadedSegment, SegmentDirectory, SegmentSource};
use crate::error::{Result, StorageError};

/// Database file name inside the index directory.
pub const SEGMENTS_FILENAME: &str = "segments.redb";

const SEGMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("segments");

/// Segment directory backed by one `redb` database per index.
///
/// `lock`/`unlock` are no-ops: the database itself serialises writers and a
/// file can only be opened once per process (see [`KvHandleRegistry`]).
///
/// `stats` reads every stored value and is O(total bytes); prefer the
/// compressed directory where cheap size accounting matters.
pub struct KvDirectory {
    root: PathBuf,
    registry: Arc<KvHandleRegistry>,
    db: RwLock<Option<Arc<Database>>>,
    read_only: AtomicBool,
}

impl KvDirectory {
    /// Create a directory rooted at `root` (the index directory).
    pub fn new(root: impl Into<PathBuf>, registry: Arc<KvHandleRegistry>) -> Self {
        Self {
            root: root.into(),
            registry,
            db: RwLock::new(None),
            read_only: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the backing database file.
    pub fn db_path(&self) -> PathBuf {
        self.root.join(SEGMENTS_FILENAME)
    }

    /// Storage key for a segment.
    pub fn segment_key(kind: &str, id: u64) -> String {
        format!("{}:{}", kind, encode_id(id))
    }

    fn db(&self) -> Result<Arc<Database>> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| StorageError::Closed(format!("KV directory {}", self.root.display())))
    }

    fn ensure_writable(&self, op: &str) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(StorageError::ReadOnly(format!(
                "{} on read-only KV directory {}",
                op,
                self.root.display()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for KvDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvDirectory")
            .field("root", &self.root)
            .field("open", &self.db.read().is_some())
            .field("read_only", &self.read_only.load(Ordering::Relaxed))
            .finish()
    }
}

impl SegmentDirectory for KvDirectory {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    fn setup(&self, read_only: bool) -> Result<()> {
        let db = self.registry.open(&self.db_path(), read_only)?;

        if !read_only {
            // Create the table up front so read transactions never miss it.
            let txn = db
                .begin_write()
                .map_err(|e| StorageError::kv("directory.kv.setup", "", e))?;
            txn.open_table(SEGMENTS)
                .map_err(|e| StorageError::kv("directory.kv.setup", "", e))?;
            txn.commit()
                .map_err(|e| StorageError::kv("directory.kv.setup", "", e))?;
        }

        self.read_only.store(read_only, Ordering::Release);
        *self.db.write() = Some(db);
        Ok(())
    }

    fn list(&self, kind: &str) -> Result<Vec<u64>> {
        let db = self.db()?;
        let txn = db
            .begin_read()
            .map_err(|e| StorageError::kv("directory.kv.list", kind, e))?;
        let table = match txn.open_table(SEGMENTS) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::kv("directory.kv.list", kind, e)),
        };

        let prefix = format!("{}:", kind);
        let mut ids = Vec::new();
        let range = table
            .range(prefix.as_str()..)
            .map_err(|e| StorageError::kv("directory.kv.list", kind, e))?;
        for entry in range {
            let (key, _) = entry.map_err(|e| StorageError::kv("directory.kv.list", kind, e))?;
            let key = key.value();
            let Some(suffix) = key.strip_prefix(prefix.as_str()) else {
                break;
            };
            let id = decode_id(suffix).ok_or_else(|| {
                StorageError::Corrupt(format!("failed to parse segment key '{}'", key))
            })?;
            ids.push(id);
        }

        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    fn load(&self, kind: &str, id: u64) -> Result<LoadedSegment> {
        let key = Self::segment_key(kind, id);
        let db = self.db()?;
        let txn = db
            .begin_read()
            .map_err(|e| StorageError::kv("directory.kv.load", &key, e))?;
        let table = match txn.open_table(SEGMENTS) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => {
                return Err(StorageError::NotFound(key));
            }
            Err(e) => return Err(StorageError::kv("directory.kv.load", &key, e)),
        };
        // Copy out so the bytes outlive the read transaction.
        let value = table
            .get(key.as_str())
            .map_err(|e| StorageError::kv("directory.kv.load", &key, e))?
            .map(|guard| guard.value().to_vec())
            .ok_or_else(|| StorageError::NotFound(key.clone()))?;
        Ok(LoadedSegment::from_bytes(value))
    }

    #[instrument(skip(self, source, cancel), fields(root = %self.root.display()))]
    fn persist(
        &self,
        kind: &str,
        id: u64,
        source: &dyn SegmentSource,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_writable("persist")?;
        let key = Self::segment_key(kind, id);
        let buf = buffer_source(source, cancel, &key)?;

        let db = self.db()?;
        let txn = db
            .begin_write()
            .map_err(|e| StorageError::kv("directory.kv.persist", &key, e))?;
        {
            let mut table = txn
                .open_table(SEGMENTS)
                .map_err(|e| StorageError::kv("directory.kv.persist", &key, e))?;
            table
                .insert(key.as_str(), buf.as_slice())
                .map_err(|e| StorageError::kv("directory.kv.persist", &key, e))?;
        }
        if cancel.is_cancelled() {
            // Dropping an uncommitted transaction aborts it.
            return Err(StorageError::Cancelled(format!("persist {}", key)));
        }
        txn.commit()
            .map_err(|e| StorageError::kv("directory.kv.persist", &key, e))?;

        debug!(key = %key, size = buf.len(), "persisted segment");
        Ok(())
    }

    fn remove(&self, kind: &str, id: u64) -> Result<()> {
        self.ensure_writable("remove")?;
        let key = Self::segment_key(kind, id);
        let db = self.db()?;
        let txn = db
            .begin_write()
            .map_err(|e| StorageError::kv("directory.kv.remove", &key, e))?;
        {
            let mut table = txn
                .open_table(SEGMENTS)
                .map_err(|e| StorageError::kv("directory.kv.remove", &key, e))?;
            table
                .remove(key.as_str())
                .map_err(|e| StorageError::kv("directory.kv.remove", &key, e))?;
        }
        txn.commit()
            .map_err(|e| StorageError::kv("directory.kv.remove", &key, e))?;
        Ok(())
    }

    fn stats(&self) -> (u64, u64) {
        let scan = || -> Result<(u64, u64)> {
            let db = self.db()?;
            let txn = db
                .begin_read()
                .map_err(|e| StorageError::kv("directory.kv.stats", "", e))?;
            let table = match txn.open_table(SEGMENTS) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok((0, 0)),
                Err(e) => return Err(StorageError::kv("directory.kv.stats", "", e)),
            };
            let count = table
                .len()
                .map_err(|e| StorageError::kv("directory.kv.stats", "", e))?;
            let mut bytes = 0u64;
            for entry in table
                .iter()
                .map_err(|e| StorageError::kv("directory.kv.stats", "", e))?
            {
                let (_, value) = entry.map_err(|e| StorageError::kv("directory.kv.stats", "", e))?;
                bytes += value.value().len() as u64;
            }
            Ok((count, bytes))
        };

        match scan() {
            Ok(stats) => stats,
            Err(e) => {
                error!(root = %self.root.display(), "failed to collect KV directory stats: {}", e);
                (0, 0)
            }
        }
    }

    fn sync(&self) -> Result<()> {
        info!(root = %self.root.display(), "syncing KV directory");
        if self.read_only.load(Ordering::Acquire) {
            return Ok(());
        }
        let db = self.db()?;
        let mut txn = db
            .begin_write()
            .map_err(|e| StorageError::kv("directory.kv.sync", "", e))?;
        txn.set_durability(Durability::Immediate);
        txn.commit()
            .map_err(|e| StorageError::kv("directory.kv.sync", "", e))
    }

    fn lock(&self) -> Result<()> {
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.db.write().take();
        Ok(())
    }

    fn read_view(&self) -> Result<Arc<dyn SegmentDirectory>> {
        // Shares the open database; closing either handle only drops its own slot.
        let db = self.db()?;
        Ok(Arc::new(Self {
            root: self.root.clone(),
            registry: self.registry.clone(),
            db: RwLock::new(Some(db)),
            read_only: AtomicBool::new(true),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "kv"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_dir(dir: &TempDir) -> KvDirectory {
        let kv = KvDirectory::new(dir.path().join("idx"), Arc::new(KvHandleRegistry::new()));
        kv.setup(false).unwrap();
        kv
    }

    #[test]
    fn test_segment_key_format() {
        assert_eq!(KvDirectory::segment_key(".seg", 10), ".seg:00000000000a");
        assert_eq!(KvDirectory::segment_key("snp", 0x1234), "snp:000000001234");
    }

    #[test]
    fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let kv = open_dir(&dir);
        let cancel = CancellationToken::new();

        kv.persist(".seg", 1, &b"hello".to_vec(), &cancel).unwrap();
        let seg = kv.load(".seg", 1).unwrap();
        assert_eq!(&seg.release().unwrap()[..], b"hello");
    }

    #[test]
    fn test_list_is_scoped_to_kind() {
        let dir = TempDir::new().unwrap();
        let kv = open_dir(&dir);
        let cancel = CancellationToken::new();

        kv.persist(".seg", 2, &b"a".to_vec(), &cancel).unwrap();
        kv.persist(".seg", 5, &b"b".to_vec(), &cancel).unwrap();
        kv.persist(".snp", 3, &b"c".to_vec(), &cancel).unwrap();

        assert_eq!(kv.list(".seg").unwrap(), vec![5, 2]);
        assert_eq!(kv.list(".snp").unwrap(), vec![3]);
        assert!(kv.list(".other").unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_key_fails_list() {
        let dir = TempDir::new().unwrap();
        let kv = open_dir(&dir);
        let db = kv.db().unwrap();
        let txn = db.begin_write().unwrap();
        {
            let mut table = txn.open_table(SEGMENTS).unwrap();
            table.insert(".seg:not-hex", b"x".as_slice()).unwrap();
        }
        txn.commit().unwrap();

        let err = kv.list(".seg").unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }

    #[test]
    fn test_read_only_setup_requires_existing_store() {
        let dir = TempDir::new().unwrap();
        let kv = KvDirectory::new(dir.path().join("idx"), Arc::new(KvHandleRegistry::new()));
        let err = kv.setup(true).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(KvHandleRegistry::new());
        let writer = KvDirectory::new(dir.path().join("idx"), registry.clone());
        writer.setup(false).unwrap();

        let reader = KvDirectory::new(dir.path().join("idx"), registry);
        reader.setup(true).unwrap();
        let err = reader
            .persist(".seg", 1, &b"x".to_vec(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, StorageError::ReadOnly(_)));
    }

    #[test]
    fn test_read_view_outlives_close() {
        let dir = TempDir::new().unwrap();
        let kv = open_dir(&dir);
        kv.persist(".seg", 1, &b"kept".to_vec(), &CancellationToken::new())
            .unwrap();

        let view = kv.read_view().unwrap();
        kv.close().unwrap();
        assert_eq!(&view.load(".seg", 1).unwrap().release().unwrap()[..], b"kept");
        let err = view
            .persist(".seg", 2, &b"x".to_vec(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, StorageError::ReadOnly(_)));
    }

    #[test]
    fn test_closed_directory_errors() {
        let dir = TempDir::new().unwrap();
        let kv = open_dir(&dir);
        kv.close().unwrap();
        assert!(matches!(kv.list(".seg").unwrap_err(), StorageError::Closed(_)));
    }
}
