//! `redb`-backed KV engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use tracing::debug;

use super::{KvBatch, KvEngine};
use crate::error::{Result, StorageError};

/// Default ceiling for a single bulk transaction (4 MiB of keys + values).
pub const DEFAULT_MAX_TXN_BYTES: usize = 4 << 20;

const SOURCE: TableDefinition<&str, &[u8]> = TableDefinition::new("source");

const DB_FILENAME: &str = "source.redb";

/// Tuning for [`RedbEngine`].
#[derive(Debug, Clone)]
pub struct RedbOptions {
    /// Bytes of keys and values a bulk transaction may accumulate before it
    /// is committed and a fresh one started.
    pub max_txn_bytes: usize,
}

impl Default for RedbOptions {
    fn default() -> Self {
        Self {
            max_txn_bytes: DEFAULT_MAX_TXN_BYTES,
        }
    }
}

/// KV engine storing all entries in one `redb` table.
pub struct RedbEngine {
    path: PathBuf,
    db: RwLock<Option<Arc<Database>>>,
    options: RedbOptions,
}

impl RedbEngine {
    /// Open or create the engine inside `dir`.
    pub fn open(dir: &Path, options: RedbOptions) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| StorageError::io("storage.redb.open", dir, e))?;
        let path = dir.join(DB_FILENAME);
        let db = Database::create(&path)
            .map_err(|e| StorageError::kv("storage.redb.open", "", e))?;

        let txn = db
            .begin_write()
            .map_err(|e| StorageError::kv("storage.redb.open", "", e))?;
        txn.open_table(SOURCE)
            .map_err(|e| StorageError::kv("storage.redb.open", "", e))?;
        txn.commit()
            .map_err(|e| StorageError::kv("storage.redb.open", "", e))?;

        debug!(path = %path.display(), "opened redb source store");
        Ok(Self {
            path,
            db: RwLock::new(Some(Arc::new(db))),
            options,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn db(&self) -> Result<Arc<Database>> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| StorageError::Closed(format!("redb store {}", self.path.display())))
    }

    /// Start a batch; see [`KvEngine::bulk`].
    pub fn begin_batch(&self, for_write: bool) -> Result<RedbBatch> {
        let db = self.db()?;
        let txn = if for_write {
            Some(
                db.begin_write()
                    .map_err(|e| StorageError::kv("storage.redb.bulk", "", e))?,
            )
        } else {
            None
        };
        Ok(RedbBatch {
            db,
            txn,
            for_write,
            pending_bytes: 0,
            max_txn_bytes: self.options.max_txn_bytes,
            auto_commits: 0,
        })
    }
}

impl KvEngine for RedbEngine {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let db = self.db()?;
        let txn = db
            .begin_write()
            .map_err(|e| StorageError::kv("storage.redb.set", key, e))?;
        {
            let mut table = txn
                .open_table(SOURCE)
                .map_err(|e| StorageError::kv("storage.redb.set", key, e))?;
            table
                .insert(key, value)
                .map_err(|e| StorageError::kv("storage.redb.set", key, e))?;
        }
        txn.commit()
            .map_err(|e| StorageError::kv("storage.redb.set", key, e))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let db = self.db()?;
        let txn = db
            .begin_read()
            .map_err(|e| StorageError::kv("storage.redb.get", key, e))?;
        let table = txn
            .open_table(SOURCE)
            .map_err(|e| StorageError::kv("storage.redb.get", key, e))?;
        let value = table
            .get(key)
            .map_err(|e| StorageError::kv("storage.redb.get", key, e))?
            .map(|guard| guard.value().to_vec());
        value.ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn gets(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        let db = self.db()?;
        let txn = db
            .begin_read()
            .map_err(|e| StorageError::kv("storage.redb.gets", "", e))?;
        let table = txn
            .open_table(SOURCE)
            .map_err(|e| StorageError::kv("storage.redb.gets", "", e))?;

        let mut result = HashMap::with_capacity(keys.len());
        for key in keys {
            let value = table
                .get(key.as_str())
                .map_err(|e| StorageError::kv("storage.redb.gets", key, e))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StorageError::NotFound(key.clone()))?;
            result.insert(key.clone(), value);
        }
        Ok(result)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let db = self.db()?;
        let txn = db
            .begin_write()
            .map_err(|e| StorageError::kv("storage.redb.delete", key, e))?;
        {
            let mut table = txn
                .open_table(SOURCE)
                .map_err(|e| StorageError::kv("storage.redb.delete", key, e))?;
            table
                .remove(key)
                .map_err(|e| StorageError::kv("storage.redb.delete", key, e))?;
        }
        txn.commit()
            .map_err(|e| StorageError::kv("storage.redb.delete", key, e))
    }

    fn bulk(&self, for_write: bool) -> Result<Box<dyn KvBatch + '_>> {
        Ok(Box::new(self.begin_batch(for_write)?))
    }

    fn close(&self) -> Result<()> {
        if self.db.write().take().is_some() {
            debug!(path = %self.path.display(), "closed redb source store");
        }
        Ok(())
    }

    fn engine_name(&self) -> &'static str {
        "redb"
    }
}

/// Bulk batch over a live `redb` write transaction.
///
/// Once the pending keys and values would exceed the configured ceiling the
/// accumulated writes are committed and the batch continues in a new
/// transaction. Atomicity therefore holds per underlying transaction.
pub struct RedbBatch {
    db: Arc<Database>,
    txn: Option<WriteTransaction>,
    for_write: bool,
    pending_bytes: usize,
    max_txn_bytes: usize,
    auto_commits: usize,
}

impl RedbBatch {
    /// Number of times the size ceiling forced an intermediate commit.
    pub fn auto_commits(&self) -> usize {
        self.auto_commits
    }

    fn writable_txn(&self, op: &str, key: &str) -> Result<&WriteTransaction> {
        if !self.for_write {
            return Err(StorageError::ReadOnly(format!("{} on read-only batch: key[{}]", op, key)));
        }
        self.txn
            .as_ref()
            .ok_or_else(|| StorageError::Closed(format!("{}: batch already committed", op)))
    }

    /// Make room for `size` more bytes, committing first if the ceiling would be crossed.
    fn reserve(&mut self, size: usize) -> Result<()> {
        if self.pending_bytes == 0 || self.pending_bytes + size <= self.max_txn_bytes {
            return Ok(());
        }
        if let Some(txn) = self.txn.take() {
            txn.commit()
                .map_err(|e| StorageError::kv("storage.redb.bulk.set: transaction.commit", "", e))?;
        }
        self.txn = Some(
            self.db
                .begin_write()
                .map_err(|e| StorageError::kv("storage.redb.bulk.set: begin", "", e))?,
        );
        self.auto_commits += 1;
        debug!(
            pending = self.pending_bytes,
            ceiling = self.max_txn_bytes,
            "bulk transaction full, committed and reopened"
        );
        self.pending_bytes = 0;
        Ok(())
    }
}

impl KvBatch for RedbBatch {
    fn set(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.writable_txn("storage.redb.bulk.set", key)?;
        let size = key.len() + value.len();
        self.reserve(size)?;

        let txn = self.writable_txn("storage.redb.bulk.set", key)?;
        {
            let mut table = txn
                .open_table(SOURCE)
                .map_err(|e| StorageError::kv("storage.redb.bulk.set", key, e))?;
            table
                .insert(key, value)
                .map_err(|e| StorageError::kv("storage.redb.bulk.set", key, e))?;
        }
        self.pending_bytes += size;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.writable_txn("storage.redb.bulk.delete", key)?;
        self.reserve(key.len())?;

        let txn = self.writable_txn("storage.redb.bulk.delete", key)?;
        {
            let mut table = txn
                .open_table(SOURCE)
                .map_err(|e| StorageError::kv("storage.redb.bulk.delete", key, e))?;
            table
                .remove(key)
                .map_err(|e| StorageError::kv("storage.redb.bulk.delete", key, e))?;
        }
        self.pending_bytes += key.len();
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        match self.txn.take() {
            Some(txn) => txn
                .commit()
                .map_err(|e| StorageError::kv("storage.redb.bulk.commit", "", e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_engine(dir: &TempDir, max_txn_bytes: usize) -> RedbEngine {
        RedbEngine::open(dir.path(), RedbOptions { max_txn_bytes }).unwrap()
    }

    #[test]
    fn test_set_get_delete() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir, DEFAULT_MAX_TXN_BYTES);

        engine.set("idx/1", b"{\"a\":1}").unwrap();
        assert_eq!(engine.get("idx/1").unwrap(), b"{\"a\":1}");

        engine.set("idx/1", b"{\"a\":2}").unwrap();
        assert_eq!(engine.get("idx/1").unwrap(), b"{\"a\":2}");

        engine.delete("idx/1").unwrap();
        assert!(engine.get("idx/1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_bulk_ceiling_auto_commits() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir, 1024);

        let mut batch = engine.begin_batch(true).unwrap();
        for i in 0..100 {
            batch.set(&format!("k{:03}", i), &[7u8; 100]).unwrap();
        }
        assert!(batch.auto_commits() > 0);
        Box::new(batch).commit().unwrap();

        for i in 0..100 {
            assert_eq!(engine.get(&format!("k{:03}", i)).unwrap(), vec![7u8; 100]);
        }
    }

    #[test]
    fn test_oversized_single_entry_is_written() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir, 16);

        let mut batch = engine.bulk(true).unwrap();
        batch.set("big", &[1u8; 1000]).unwrap();
        batch.commit().unwrap();
        assert_eq!(engine.get("big").unwrap().len(), 1000);
    }

    #[test]
    fn test_uncommitted_batch_is_discarded() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir, DEFAULT_MAX_TXN_BYTES);
        {
            let mut batch = engine.bulk(true).unwrap();
            batch.set("gone", b"x").unwrap();
        }
        assert!(engine.get("gone").unwrap_err().is_not_found());
    }

    #[test]
    fn test_read_only_batch_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir, DEFAULT_MAX_TXN_BYTES);
        let mut batch = engine.bulk(false).unwrap();
        assert!(matches!(
            batch.set("k", b"v").unwrap_err(),
            StorageError::ReadOnly(_)
        ));
        batch.commit().unwrap();
    }

    #[test]
    fn test_close_then_use() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir, DEFAULT_MAX_TXN_BYTES);
        engine.close().unwrap();
        engine.close().unwrap();
        assert!(matches!(engine.get("k").unwrap_err(), StorageError::Closed(_)));
    }
}
