//! Embedded key-value engines used for original (source) documents.
//!
//! Two interchangeable engines implement [`KvEngine`]:
//!
//! - [`RedbEngine`]: bulk batches write through a live transaction with a
//!   size ceiling; crossing it commits and continues in a fresh transaction.
//! - [`SqliteEngine`]: bulk batches accumulate operations and apply them in
//!   one transaction on commit.
//!
//! [`SourceStoreRegistry`] caches one opened engine per index name.

mod redb_engine;
mod registry;
mod sqlite;

pub use redb_engine::{RedbBatch, RedbEngine, RedbOptions, DEFAULT_MAX_TXN_BYTES};
pub use registry::{source_dir, SourceStoreRegistry, SOURCE_STORAGE_DIR};
pub use sqlite::{SqliteBatch, SqliteEngine};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A key-value store handle.
///
/// Point reads see a consistent snapshot; writes from concurrent callers are
/// serialised by the engine.
pub trait KvEngine: Send + Sync {
    /// Insert or overwrite `key`.
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch `key`, failing with [`crate::StorageError::NotFound`] if absent.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Fetch several keys at once.
    ///
    /// All-or-nothing: if any key is missing the whole call fails and no
    /// partial mapping is returned.
    fn gets(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>>;

    /// Delete `key`.
    fn delete(&self, key: &str) -> Result<()>;

    /// Start a batch of writes applied atomically on [`KvBatch::commit`].
    ///
    /// With `for_write` unset the batch rejects mutations.
    fn bulk(&self, for_write: bool) -> Result<Box<dyn KvBatch + '_>>;

    /// Close the engine. Further calls fail with [`crate::StorageError::Closed`].
    fn close(&self) -> Result<()>;

    /// Engine name.
    fn engine_name(&self) -> &'static str;
}

/// A batch of writes owned by a single caller.
pub trait KvBatch {
    fn set(&mut self, key: &str, value: &[u8]) -> Result<()>;

    fn delete(&mut self, key: &str) -> Result<()>;

    /// Apply every pending operation.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvEngineKind {
    #[default]
    Redb,
    Sqlite,
}

impl KvEngineKind {
    /// Parse an engine name, case-insensitively.
    ///
    /// `badger` and `pebble` are accepted as aliases of `redb` and `sqlite`;
    /// anything unrecognised falls back to the default.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "pebble" => Self::Sqlite,
            _ => Self::Redb,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redb => "redb",
            Self::Sqlite => "sqlite",
        }
    }

    /// Open an engine of this kind inside directory `dir`.
    pub fn open(&self, dir: &Path, options: &RedbOptions) -> Result<Arc<dyn KvEngine>> {
        let engine: Arc<dyn KvEngine> = match self {
            Self::Redb => Arc::new(RedbEngine::open(dir, options.clone())?),
            Self::Sqlite => Arc::new(SqliteEngine::open(dir)?),
        };
        Ok(engine)
    }
}

impl std::fmt::Display for KvEngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of a source document: `"{index}/{doc_id}"`.
pub fn source_key(index: &str, doc_id: &str) -> String {
    format!("{}/{}", index, doc_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_from_name() {
        assert_eq!(KvEngineKind::from_name("REDB"), KvEngineKind::Redb);
        assert_eq!(KvEngineKind::from_name("badger"), KvEngineKind::Redb);
        assert_eq!(KvEngineKind::from_name("Pebble"), KvEngineKind::Sqlite);
        assert_eq!(KvEngineKind::from_name("sqlite"), KvEngineKind::Sqlite);
        assert_eq!(KvEngineKind::from_name("leveldb"), KvEngineKind::Redb);
    }

    #[test]
    fn test_source_key() {
        assert_eq!(source_key("logs", "42"), "logs/42");
    }
}
