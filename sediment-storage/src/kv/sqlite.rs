//! SQLite-backed KV engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{KvBatch, KvEngine};
use crate::error::{Result, StorageError};

const DB_FILENAME: &str = "source.sqlite3";

/// KV engine over a single `kv` table in SQLite (WAL mode).
pub struct SqliteEngine {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl SqliteEngine {
    /// Open or create the engine inside `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| StorageError::io("storage.sqlite.open", dir, e))?;
        let path = dir.join(DB_FILENAME);

        let conn =
            Connection::open(&path).map_err(|e| StorageError::kv("storage.sqlite.open", "", e))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| StorageError::kv("storage.sqlite.open", "", e))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=-64000;
             PRAGMA temp_store=MEMORY;",
        )
        .map_err(|e| StorageError::kv("storage.sqlite.open", "", e))?;

        debug!(path = %path.display(), "opened sqlite source store");
        Ok(Self {
            path,
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        let guard = self.conn.lock();
        if guard.is_none() {
            return Err(StorageError::Closed(format!(
                "sqlite store {}",
                self.path.display()
            )));
        }
        Ok(guard)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn()?;
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(StorageError::Closed(format!(
                "sqlite store {}",
                self.path.display()
            ))),
        }
    }

    /// Start a batch; see [`KvEngine::bulk`].
    pub fn begin_batch(&self, for_write: bool) -> SqliteBatch<'_> {
        SqliteBatch {
            engine: self,
            for_write,
            ops: Vec::new(),
        }
    }
}

impl KvEngine for SqliteEngine {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(|e| StorageError::kv("storage.sqlite.set", key, e))?;
            Ok(())
        })
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
            .map_err(|e| StorageError::kv("storage.sqlite.get", key, e))?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
        })
    }

    fn gets(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT value FROM kv WHERE key = ?1")
                .map_err(|e| StorageError::kv("storage.sqlite.gets", "", e))?;

            let mut result = HashMap::with_capacity(keys.len());
            for key in keys {
                let value = stmt
                    .query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
                    .optional()
                    .map_err(|e| StorageError::kv("storage.sqlite.gets", key, e))?
                    .ok_or_else(|| StorageError::NotFound(key.clone()))?;
                result.insert(key.clone(), value);
            }
            Ok(result)
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map_err(|e| StorageError::kv("storage.sqlite.delete", key, e))?;
            Ok(())
        })
    }

    fn bulk(&self, for_write: bool) -> Result<Box<dyn KvBatch + '_>> {
        drop(self.conn()?);
        Ok(Box::new(self.begin_batch(for_write)))
    }

    fn close(&self) -> Result<()> {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close()
                .map_err(|(_, e)| StorageError::kv("storage.sqlite.close", "", e))?;
            debug!(path = %self.path.display(), "closed sqlite source store");
        }
        Ok(())
    }

    fn engine_name(&self) -> &'static str {
        "sqlite"
    }
}

enum BatchOp {
    Set(String, Vec<u8>),
    Delete(String),
}

/// Batch that accumulates operations and applies them in one transaction on commit.
pub struct SqliteBatch<'a> {
    engine: &'a SqliteEngine,
    for_write: bool,
    ops: Vec<BatchOp>,
}

impl SqliteBatch<'_> {
    /// Number of pending operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn check_writable(&self, op: &str, key: &str) -> Result<()> {
        if self.for_write {
            Ok(())
        } else {
            Err(StorageError::ReadOnly(format!(
                "{} on read-only batch: key[{}]",
                op, key
            )))
        }
    }
}

impl KvBatch for SqliteBatch<'_> {
    fn set(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.check_writable("storage.sqlite.bulk.set", key)?;
        self.ops.push(BatchOp::Set(key.to_string(), value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.check_writable("storage.sqlite.bulk.delete", key)?;
        self.ops.push(BatchOp::Delete(key.to_string()));
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let count = self.ops.len();
        self.engine.with_conn(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| StorageError::kv("storage.sqlite.bulk.commit", "", e))?;
            {
                let mut set = tx
                    .prepare_cached("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)")
                    .map_err(|e| StorageError::kv("storage.sqlite.bulk.commit", "", e))?;
                let mut del = tx
                    .prepare_cached("DELETE FROM kv WHERE key = ?1")
                    .map_err(|e| StorageError::kv("storage.sqlite.bulk.commit", "", e))?;
                for op in &self.ops {
                    match op {
                        BatchOp::Set(key, value) => set
                            .execute(params![key, value])
                            .map_err(|e| StorageError::kv("storage.sqlite.bulk.set", key, e))?,
                        BatchOp::Delete(key) => del
                            .execute(params![key])
                            .map_err(|e| StorageError::kv("storage.sqlite.bulk.delete", key, e))?,
                    };
                }
            }
            tx.commit()
                .map_err(|e| StorageError::kv("storage.sqlite.bulk.commit", "", e))?;
            debug!(ops = count, "applied sqlite batch");
            Ok(())
        })
    }
}
