//! Persistence layer for the sediment search engine.
//!
//! Two independent stores live here:
//!
//! - **Segment directories** hold the immutable index segments written by the
//!   indexing library. A [`SegmentDirectory`] is either KV-backed
//!   ([`KvDirectory`], one `redb` file per index) or a plain directory of
//!   compressed files ([`CompressedDirectory`]) using one of the
//!   [`CompressionAlgorithm`] codecs.
//! - **Source stores** keep the original document bodies in an embedded
//!   [`KvEngine`], one per index, cached by [`SourceStoreRegistry`].
//!
//! # On-disk layout
//!
//! ```text
//! {data_root}/
//!   {index}/                      segment directory
//!     000000000001.seg            compressed backend: "{id:012x}{kind}"
//!     bluge.pid                   writer lock
//!     segments.redb               KV backend: keys "{kind}:{id:012x}"
//!   _storage/
//!     {index}/source.redb         source store (or source.sqlite3)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sediment_storage::{
//!     CancellationToken, CompressionAlgorithm, DirectoryFactory, KvHandleRegistry, StorageType,
//! };
//!
//! # fn example() -> sediment_storage::Result<()> {
//! let factory = DirectoryFactory::new(
//!     "./data",
//!     CompressionAlgorithm::Zstd,
//!     Arc::new(KvHandleRegistry::new()),
//! );
//! let dir = factory.directory("products", StorageType::Disk);
//! dir.setup(false)?;
//! dir.persist(".seg", 1, &b"segment bytes".to_vec(), &CancellationToken::new())?;
//! let segment = dir.load(".seg", 1)?;
//! assert_eq!(&segment.data()[..], b"segment bytes");
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod directory;
mod error;
pub mod kv;

pub use codec::CompressionAlgorithm;
pub use directory::{
    decode_id, encode_id, CompressedDirectory, DirectoryFactory, KvDirectory, KvHandleRegistry,
    LoadedSegment, SegmentDirectory, SegmentSource, StorageType, ID_HEX_WIDTH, PID_FILENAME,
    SEGMENTS_FILENAME,
};
pub use error::{Result, StorageError};
pub use kv::{
    source_key, KvBatch, KvEngine, KvEngineKind, RedbOptions, SourceStoreRegistry,
    DEFAULT_MAX_TXN_BYTES,
};

pub use bytes::Bytes;
pub use tokio_util::sync::CancellationToken;
