pub mod docs;
pub mod segments;

use std::sync::Arc;

use anyhow::Result;
use sediment::{Engine, Index, IndexMeta};

pub use docs::{delete_doc, get_doc, put_doc};
pub use segments::{add_segment, get_segment, list_segments, remove_segment, segment_stats};

/// Register `name` with the engine for the lifetime of one command.
///
/// The CLI has no catalog: the index is described by the configured default
/// storage type and picks up whatever data already exists on disk.
fn open_index(engine: &Engine, name: &str) -> Result<Arc<Index>> {
    if let Ok(index) = engine.indexes().get(name) {
        return Ok(index);
    }
    Ok(engine.indexes().create_index(IndexMeta::new(name))?)
}
