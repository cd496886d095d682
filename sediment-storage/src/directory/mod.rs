//! Segment directories.
//!
//! A [`SegmentDirectory`] is the storage contract an index writer uses to
//! persist, list, load and remove immutable segment blobs. Every segment is
//! addressed by a `(kind, id)` pair: `kind` is a short category tag such as
//! `.seg` or `.snp` and `id` is a generation number assigned by the writer.
//!
//! Two backends implement the contract:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              SegmentDirectory                │
//! └──────────────┬──────────────────┬────────────┘
//!                ▼                  ▼
//!   ┌───────────────────────┐ ┌───────────────────────────┐
//!   │ KvDirectory (redb)    │ │ CompressedDirectory (fs)  │
//!   │ key "{kind}:{id:012x}"│ │ file "{id:012x}{kind}"    │
//!   └───────────────────────┘ └─────────────┬─────────────┘
//!                                           ▼
//!                                  CompressionAlgorithm
//! ```

mod compressed;
mod kv;
mod registry;

pub use compressed::{CompressedDirectory, PID_FILENAME};
pub use kv::{KvDirectory, SEGMENTS_FILENAME};
pub use registry::KvHandleRegistry;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::codec::CompressionAlgorithm;
use crate::error::{Result, StorageError};

/// Minimum number of hex digits used to encode a segment id.
pub const ID_HEX_WIDTH: usize = 12;

/// Chunk size used when streaming in-memory sources.
const SOURCE_CHUNK_SIZE: usize = 64 * 1024;

/// Storage contract for the immutable segments of one index.
///
/// All methods take `&self`; implementations use interior mutability and
/// must be safe to share between threads.
pub trait SegmentDirectory: Send + Sync + std::fmt::Debug {
    /// Prepare the backing storage.
    ///
    /// Fails with [`StorageError::Config`] if `read_only` is requested and no
    /// storage exists yet.
    fn setup(&self, read_only: bool) -> Result<()>;

    /// Ids of every live segment of `kind`, in descending order.
    ///
    /// A stored name that cannot be parsed as an id fails the whole call
    /// with [`StorageError::Corrupt`].
    fn list(&self, kind: &str) -> Result<Vec<u64>>;

    /// Load the full bytes of a segment.
    ///
    /// The returned [`LoadedSegment`] must be released once the caller is done.
    fn load(&self, kind: &str, id: u64) -> Result<LoadedSegment>;

    /// Durably write a new segment from `source`.
    ///
    /// `cancel` is polled while the source is buffered. On any failure,
    /// including cancellation, nothing for `(kind, id)` remains visible.
    fn persist(
        &self,
        kind: &str,
        id: u64,
        source: &dyn SegmentSource,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Delete a segment.
    fn remove(&self, kind: &str, id: u64) -> Result<()>;

    /// Number of stored items and their cumulative size in bytes.
    ///
    /// Best effort: failures are logged and yield partial or zero counts.
    fn stats(&self) -> (u64, u64);

    /// Make directory-level metadata durable.
    fn sync(&self) -> Result<()>;

    /// Acquire exclusive write access to the whole directory.
    fn lock(&self) -> Result<()>;

    /// Release the lock taken by [`SegmentDirectory::lock`].
    fn unlock(&self) -> Result<()>;

    /// Release underlying resources.
    fn close(&self) -> Result<()>;

    /// A read-only handle over the same storage.
    ///
    /// The returned handle stays usable after this one is closed.
    fn read_view(&self) -> Result<Arc<dyn SegmentDirectory>>;

    /// Human-readable backend name.
    fn backend_name(&self) -> &'static str;
}

/// Producer of segment bytes handed to [`SegmentDirectory::persist`].
pub trait SegmentSource: Send + Sync {
    /// Stream the segment into `w`, returning the number of bytes written.
    ///
    /// Implementations should stop early with an error once `cancel` fires.
    fn write_to(&self, w: &mut dyn Write, cancel: &CancellationToken) -> io::Result<u64>;
}

fn write_chunked(data: &[u8], w: &mut dyn Write, cancel: &CancellationToken) -> io::Result<u64> {
    for chunk in data.chunks(SOURCE_CHUNK_SIZE) {
        if cancel.is_cancelled() {
            return Err(cancelled_io());
        }
        w.write_all(chunk)?;
    }
    Ok(data.len() as u64)
}

impl SegmentSource for Vec<u8> {
    fn write_to(&self, w: &mut dyn Write, cancel: &CancellationToken) -> io::Result<u64> {
        write_chunked(self, w, cancel)
    }
}

impl SegmentSource for &[u8] {
    fn write_to(&self, w: &mut dyn Write, cancel: &CancellationToken) -> io::Result<u64> {
        write_chunked(self, w, cancel)
    }
}

impl SegmentSource for Bytes {
    fn write_to(&self, w: &mut dyn Write, cancel: &CancellationToken) -> io::Result<u64> {
        write_chunked(self, w, cancel)
    }
}

fn cancelled_io() -> io::Error {
    io::Error::other("segment write cancelled")
}

/// In-memory write buffer that refuses further writes once cancelled.
pub(crate) struct CancellableBuffer<'a> {
    buf: Vec<u8>,
    cancel: &'a CancellationToken,
}

impl<'a> CancellableBuffer<'a> {
    pub(crate) fn new(cancel: &'a CancellationToken) -> Self {
        Self {
            buf: Vec::new(),
            cancel,
        }
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Write for CancellableBuffer<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled_io());
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffer a segment source in memory, honouring cancellation.
pub(crate) fn buffer_source(
    source: &dyn SegmentSource,
    cancel: &CancellationToken,
    name: &str,
) -> Result<Vec<u8>> {
    let mut buffer = CancellableBuffer::new(cancel);
    let outcome = source.write_to(&mut buffer, cancel);
    // Cancellation wins over whatever error the source reported.
    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled(format!("persist {}", name)));
    }
    outcome.map_err(|e| StorageError::io("persist", name, e))?;
    Ok(buffer.into_inner())
}

/// A loaded segment and the handle that keeps it pinned.
///
/// Call [`LoadedSegment::release`] when done; dropping the value releases it too.
#[derive(Debug)]
pub struct LoadedSegment {
    data: Bytes,
    guard: Option<std::fs::File>,
}

impl LoadedSegment {
    /// A segment with nothing to release.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            guard: None,
        }
    }

    /// A segment whose backing file stays share-locked until released.
    pub(crate) fn with_file_guard(data: impl Into<Bytes>, file: std::fs::File) -> Self {
        Self {
            data: data.into(),
            guard: Some(file),
        }
    }

    /// Segment bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Release the handle, returning the bytes.
    pub fn release(mut self) -> Result<Bytes> {
        if let Some(file) = self.guard.take() {
            fs2::FileExt::unlock(&file).map_err(|e| StorageError::io("release", "segment", e))?;
        }
        Ok(std::mem::take(&mut self.data))
    }
}

impl Drop for LoadedSegment {
    fn drop(&mut self) {
        if let Some(file) = self.guard.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

/// Render a segment id as lowercase hex, zero-padded to [`ID_HEX_WIDTH`] digits.
///
/// Ids of 2^48 and above render with more digits rather than being truncated.
pub fn encode_id(id: u64) -> String {
    format!("{:0width$x}", id, width = ID_HEX_WIDTH)
}

/// Parse a hex id produced by [`encode_id`].
pub fn decode_id(hex: &str) -> Option<u64> {
    if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

/// Which segment directory backend an index uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Compressed files on the local filesystem
    #[default]
    Disk,
    /// A single embedded KV store per index
    Kv,
}

impl StorageType {
    /// Parse a storage type name, case-insensitively.
    ///
    /// `badger` is accepted as an alias of `kv`; unknown names map to `disk`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "kv" | "badger" => Self::Kv,
            _ => Self::Disk,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::Kv => "kv",
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds segment directories for indexes under one data root.
///
/// The compression algorithm and the shared KV handle registry are fixed at
/// construction, so every directory of a given storage type behaves the same.
#[derive(Debug, Clone)]
pub struct DirectoryFactory {
    data_root: PathBuf,
    compression: CompressionAlgorithm,
    kv_handles: Arc<KvHandleRegistry>,
}

impl DirectoryFactory {
    pub fn new(
        data_root: impl Into<PathBuf>,
        compression: CompressionAlgorithm,
        kv_handles: Arc<KvHandleRegistry>,
    ) -> Self {
        Self {
            data_root: data_root.into(),
            compression,
            kv_handles,
        }
    }

    /// On-disk location of an index's segments: `{data_root}/{index}`.
    pub fn index_path(&self, index: &str) -> PathBuf {
        self.data_root.join(index)
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn compression(&self) -> CompressionAlgorithm {
        self.compression
    }

    pub fn kv_handles(&self) -> &Arc<KvHandleRegistry> {
        &self.kv_handles
    }

    /// Create an (unopened) directory for `index`; call `setup` before use.
    pub fn directory(&self, index: &str, storage_type: StorageType) -> Arc<dyn SegmentDirectory> {
        let path = self.index_path(index);
        match storage_type {
            StorageType::Disk => Arc::new(CompressedDirectory::new(path, self.compression)),
            StorageType::Kv => Arc::new(KvDirectory::new(path, self.kv_handles.clone())),
        }
    }
}
