//! Storage error types.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Storage operation errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error during a storage operation, with the operation and path involved.
    #[error("{op}: I/O error on {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Segment, key or store not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A stored key or filename could not be parsed back into a segment id
    #[error("Corrupt entry: {0}")]
    Corrupt(String),

    /// Another process (or handle) holds the lock
    #[error("Lock unavailable: {0}")]
    Locked(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mutation attempted through a read-only handle
    #[error("Read-only: {0}")]
    ReadOnly(String),

    /// The caller cancelled the operation
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Compression or decompression failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// Embedded KV engine error
    #[error("KV engine error: {0}")]
    Kv(String),

    /// Handle used after close
    #[error("Closed: {0}")]
    Closed(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Wrap an I/O error with the operation name and the path it touched.
    ///
    /// `NotFound` I/O errors are kept as [`StorageError::Io`]; use
    /// [`StorageError::is_not_found`] to test for them.
    pub fn io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        StorageError::Io {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Build a [`StorageError::Kv`] from an engine error with operation/key context.
    pub(crate) fn kv(op: &str, key: &str, err: impl std::fmt::Display) -> Self {
        if key.is_empty() {
            StorageError::Kv(format!("{}: {}", op, err))
        } else {
            StorageError::Kv(format!("{}: key[{}] {}", op, key, err))
        }
    }

    /// Check if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
            || matches!(self, StorageError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    /// Check if this error was caused by a cancellation request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled(_))
    }

    /// Check if this is a lock contention error.
    pub fn is_locked(&self) -> bool {
        matches!(self, StorageError::Locked(_))
    }
}
