//! Segment writer and reader handles over a [`SegmentDirectory`].
//!
//! A writer owns its directory exclusively (it takes the directory lock),
//! persists data segments of kind [`SEGMENT_KIND`] and, after every change,
//! a JSON snapshot of kind [`SNAPSHOT_KIND`] listing the live segments. Readers
//! see the segments of one snapshot, optionally narrowed to a time window.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sediment_storage::{
    CancellationToken, LoadedSegment, SegmentDirectory, SegmentSource, StorageError,
};

use crate::analysis::Analyzer;
use crate::error::{Error, Result};

/// Kind tag of data segments.
pub const SEGMENT_KIND: &str = ".seg";

/// Kind tag of commit snapshots.
pub const SNAPSHOT_KIND: &str = ".snp";

/// A live segment as recorded in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub id: u64,
    /// Uncompressed size in bytes
    pub size: u64,
    pub time_min: i64,
    pub time_max: i64,
}

impl SegmentMeta {
    /// Whether the segment overlaps `[time_min, time_max]`; a zero bound is open.
    pub fn overlaps(&self, time_min: i64, time_max: i64) -> bool {
        (time_min == 0 || self.time_max >= time_min) && (time_max == 0 || self.time_min <= time_max)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    segments: Vec<SegmentMeta>,
}

/// Load the newest snapshot of a directory, or an empty one.
fn load_latest_snapshot(directory: &dyn SegmentDirectory) -> Result<(Option<u64>, Snapshot)> {
    let Some(&id) = directory.list(SNAPSHOT_KIND)?.first() else {
        return Ok((None, Snapshot::default()));
    };
    let loaded = directory.load(SNAPSHOT_KIND, id)?;
    let snapshot: Snapshot = serde_json::from_slice(loaded.data())?;
    loaded.release()?;
    Ok((Some(id), snapshot))
}

struct WriterState {
    next_id: u64,
    snapshot_id: Option<u64>,
    segments: Vec<SegmentMeta>,
    closed: bool,
}

/// Exclusive write handle on one index's segment directory.
pub struct SegmentWriter {
    index: String,
    directory: Arc<dyn SegmentDirectory>,
    analyzer: Option<Arc<Analyzer>>,
    state: Mutex<WriterState>,
}

impl SegmentWriter {
    /// Set up and lock `directory`, then resume from its newest snapshot.
    pub fn open(
        index: &str,
        directory: Arc<dyn SegmentDirectory>,
        analyzer: Option<Arc<Analyzer>>,
    ) -> Result<Self> {
        directory.setup(false)?;
        directory.lock()?;

        let resume = || -> Result<WriterState> {
            let (snapshot_id, snapshot) = load_latest_snapshot(directory.as_ref())?;
            let last_segment = directory.list(SEGMENT_KIND)?.first().copied();
            let max_id = last_segment.max(snapshot_id).unwrap_or(0);
            Ok(WriterState {
                next_id: max_id + 1,
                snapshot_id,
                segments: snapshot.segments,
                closed: false,
            })
        };
        let state = match resume() {
            Ok(state) => state,
            Err(e) => {
                if let Err(unlock_err) = directory.unlock() {
                    warn!(index, "failed to unlock after open error: {}", unlock_err);
                }
                return Err(e);
            }
        };

        info!(
            index,
            backend = directory.backend_name(),
            segments = state.segments.len(),
            next_id = state.next_id,
            "opened segment writer"
        );
        Ok(Self {
            index: index.to_string(),
            directory,
            analyzer,
            state: Mutex::new(state),
        })
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn analyzer(&self) -> Option<&Arc<Analyzer>> {
        self.analyzer.as_ref()
    }

    pub fn directory(&self) -> &Arc<dyn SegmentDirectory> {
        &self.directory
    }

    /// Live segments, newest last.
    pub fn segments(&self) -> Vec<SegmentMeta> {
        self.state.lock().segments.clone()
    }

    /// Persist a data segment covering `[time_min, time_max]` and commit it.
    ///
    /// Returns the id assigned to the segment.
    pub fn add_segment(
        &self,
        source: &dyn SegmentSource,
        time_min: i64,
        time_max: i64,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, &self.index)?;

        let id = state.next_id;
        let mut buf = Vec::new();
        source.write_to(&mut buf, cancel).map_err(|e| {
            if cancel.is_cancelled() {
                Error::Storage(StorageError::Cancelled(format!("segment {}", id)))
            } else {
                Error::Io(e)
            }
        })?;
        let size = buf.len() as u64;
        self.directory.persist(SEGMENT_KIND, id, &buf, cancel)?;
        state.next_id += 1;

        let mut segments = state.segments.clone();
        segments.push(SegmentMeta {
            id,
            size,
            time_min,
            time_max,
        });
        if let Err(e) = self.commit_locked(&mut state, segments) {
            // Not referenced by any snapshot; drop it.
            if let Err(remove_err) = self.directory.remove(SEGMENT_KIND, id) {
                warn!(index = %self.index, id, "failed to remove uncommitted segment: {}", remove_err);
            }
            return Err(e);
        }
        debug!(index = %self.index, id, size, "added segment");
        Ok(id)
    }

    /// Drop a segment from the live set and delete its data.
    ///
    /// Returns false if the segment was not live.
    pub fn remove_segment(&self, id: u64) -> Result<bool> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, &self.index)?;
        if !state.segments.iter().any(|s| s.id == id) {
            return Ok(false);
        }
        let segments = state
            .segments
            .iter()
            .filter(|s| s.id != id)
            .cloned()
            .collect();
        self.commit_locked(&mut state, segments)?;
        self.directory.remove(SEGMENT_KIND, id)?;
        debug!(index = %self.index, id, "removed segment");
        Ok(true)
    }

    /// Point-in-time reader over the current live segments.
    ///
    /// The reader holds its own read-only view of the directory and keeps
    /// working after the writer is closed.
    pub fn reader(&self) -> Result<SegmentReader> {
        let state = self.state.lock();
        Self::ensure_open(&state, &self.index)?;
        Ok(SegmentReader {
            index: self.index.clone(),
            directory: self.directory.read_view()?,
            analyzer: self.analyzer.clone(),
            segments: state.segments.clone(),
            time_range: (0, 0),
            live: true,
        })
    }

    /// Sync, unlock and close the directory. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        // Unlock and close even when sync fails.
        let synced = self.directory.sync();
        let unlocked = self.directory.unlock();
        let closed = self.directory.close();
        synced?;
        unlocked?;
        closed?;
        info!(index = %self.index, "closed segment writer");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn ensure_open(state: &WriterState, index: &str) -> Result<()> {
        if state.closed {
            return Err(Error::Storage(StorageError::Closed(format!(
                "writer of index {}",
                index
            ))));
        }
        Ok(())
    }

    /// Persist a snapshot listing `segments` and retire the previous one.
    fn commit_locked(&self, state: &mut WriterState, segments: Vec<SegmentMeta>) -> Result<()> {
        let snapshot = Snapshot { segments };
        let bytes = serde_json::to_vec(&snapshot)?;
        let id = state.next_id;
        self.directory
            .persist(SNAPSHOT_KIND, id, &bytes, &CancellationToken::new())?;
        state.next_id += 1;

        if let Some(previous) = state.snapshot_id.replace(id) {
            if let Err(e) = self.directory.remove(SNAPSHOT_KIND, previous) {
                warn!(index = %self.index, previous, "failed to remove old snapshot: {}", e);
            }
        }
        state.segments = snapshot.segments;
        Ok(())
    }
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("index", &self.index)
            .field("directory", &self.directory)
            .finish()
    }
}

/// Read handle over the segments of one snapshot.
pub struct SegmentReader {
    index: String,
    directory: Arc<dyn SegmentDirectory>,
    analyzer: Option<Arc<Analyzer>>,
    segments: Vec<SegmentMeta>,
    time_range: (i64, i64),
    live: bool,
}

impl SegmentReader {
    /// Open `directory` read-only and keep the newest snapshot's segments
    /// overlapping `[time_min, time_max]` (`0` leaves a bound open).
    pub fn open_historical(
        index: &str,
        directory: Arc<dyn SegmentDirectory>,
        analyzer: Option<Arc<Analyzer>>,
        time_min: i64,
        time_max: i64,
    ) -> Result<Self> {
        directory.setup(true)?;
        let (_, snapshot) = load_latest_snapshot(directory.as_ref())?;
        let segments: Vec<SegmentMeta> = snapshot
            .segments
            .into_iter()
            .filter(|s| s.overlaps(time_min, time_max))
            .collect();
        debug!(index, time_min, time_max, segments = segments.len(), "opened historical reader");
        Ok(Self {
            index: index.to_string(),
            directory,
            analyzer,
            segments,
            time_range: (time_min, time_max),
            live: false,
        })
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn analyzer(&self) -> Option<&Arc<Analyzer>> {
        self.analyzer.as_ref()
    }

    pub fn segments(&self) -> &[SegmentMeta] {
        &self.segments
    }

    pub fn time_range(&self) -> (i64, i64) {
        self.time_range
    }

    /// Whether this reader was derived from a live writer.
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Load a segment visible to this reader.
    pub fn load(&self, id: u64) -> Result<LoadedSegment> {
        if !self.segments.iter().any(|s| s.id == id) {
            return Err(Error::Storage(StorageError::NotFound(
                format!("segment {} not visible in index {}", id, self.index),
            )));
        }
        Ok(self.directory.load(SEGMENT_KIND, id)?)
    }
}

impl Drop for SegmentReader {
    fn drop(&mut self) {
        if let Err(e) = self.directory.close() {
            debug!(index = %self.index, "failed to close reader directory: {}", e);
        }
    }
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("index", &self.index)
            .field("segments", &self.segments.len())
            .field("time_range", &self.time_range)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sediment_storage::{CompressedDirectory, CompressionAlgorithm};
    use tempfile::TempDir;

    fn directory(dir: &TempDir) -> Arc<dyn SegmentDirectory> {
        Arc::new(CompressedDirectory::new(
            dir.path().join("idx"),
            CompressionAlgorithm::Lz4,
        ))
    }

    #[test]
    fn test_ids_continue_after_reopen() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let writer = SegmentWriter::open("idx", directory(&dir), None).unwrap();
        let first = writer.add_segment(&b"one".to_vec(), 10, 20, &cancel).unwrap();
        let second = writer.add_segment(&b"two".to_vec(), 30, 40, &cancel).unwrap();
        assert!(second > first);
        writer.close().unwrap();

        let writer = SegmentWriter::open("idx", directory(&dir), None).unwrap();
        assert_eq!(writer.segments().len(), 2);
        let third = writer.add_segment(&b"three".to_vec(), 50, 60, &cancel).unwrap();
        assert!(third > second);
        writer.close().unwrap();
    }

    #[test]
    fn test_only_latest_snapshot_kept() {
        let dir = TempDir::new().unwrap();
        let directory = directory(&dir);
        let writer = SegmentWriter::open("idx", directory.clone(), None).unwrap();
        for i in 0..3 {
            writer
                .add_segment(&vec![i as u8; 16], 0, 0, &CancellationToken::new())
                .unwrap();
        }
        assert_eq!(directory.list(SNAPSHOT_KIND).unwrap().len(), 1);
        assert_eq!(directory.list(SEGMENT_KIND).unwrap().len(), 3);
        writer.close().unwrap();
    }

    #[test]
    fn test_remove_segment() {
        let dir = TempDir::new().unwrap();
        let directory = directory(&dir);
        let writer = SegmentWriter::open("idx", directory.clone(), None).unwrap();
        let id = writer
            .add_segment(&b"gone soon".to_vec(), 0, 0, &CancellationToken::new())
            .unwrap();

        assert!(writer.remove_segment(id).unwrap());
        assert!(!writer.remove_segment(id).unwrap());
        assert!(writer.segments().is_empty());
        assert!(directory.list(SEGMENT_KIND).unwrap().is_empty());
        writer.close().unwrap();
    }

    #[test]
    fn test_live_reader_loads_segments() {
        let dir = TempDir::new().unwrap();
        let writer = SegmentWriter::open("idx", directory(&dir), None).unwrap();
        let id = writer
            .add_segment(&b"payload".to_vec(), 1, 2, &CancellationToken::new())
            .unwrap();

        let reader = writer.reader().unwrap();
        assert!(reader.is_live());
        assert_eq!(&reader.load(id).unwrap().release().unwrap()[..], b"payload");
        assert!(reader.load(id + 100).unwrap_err().is_not_found());
        drop(reader);

        // The writer keeps working after its reader is gone.
        writer
            .add_segment(&b"more".to_vec(), 3, 4, &CancellationToken::new())
            .unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_live_reader_survives_writer_close() {
        let dir = TempDir::new().unwrap();
        let writer = SegmentWriter::open("idx", directory(&dir), None).unwrap();
        let id = writer
            .add_segment(&b"payload".to_vec(), 1, 2, &CancellationToken::new())
            .unwrap();

        let reader = writer.reader().unwrap();
        writer.close().unwrap();
        assert_eq!(&reader.load(id).unwrap().release().unwrap()[..], b"payload");
    }

    /// Delegates to a compressed directory but refuses snapshots and removals.
    #[derive(Debug)]
    struct NoCommitDirectory(CompressedDirectory);

    impl SegmentDirectory for NoCommitDirectory {
        fn setup(&self, read_only: bool) -> sediment_storage::Result<()> {
            self.0.setup(read_only)
        }
        fn list(&self, kind: &str) -> sediment_storage::Result<Vec<u64>> {
            self.0.list(kind)
        }
        fn load(&self, kind: &str, id: u64) -> sediment_storage::Result<LoadedSegment> {
            self.0.load(kind, id)
        }
        fn persist(
            &self,
            kind: &str,
            id: u64,
            source: &dyn SegmentSource,
            cancel: &CancellationToken,
        ) -> sediment_storage::Result<()> {
            if kind == SNAPSHOT_KIND {
                return Err(StorageError::ReadOnly("snapshot".to_string()));
            }
            self.0.persist(kind, id, source, cancel)
        }
        fn remove(&self, _kind: &str, _id: u64) -> sediment_storage::Result<()> {
            Err(StorageError::ReadOnly("remove".to_string()))
        }
        fn stats(&self) -> (u64, u64) {
            self.0.stats()
        }
        fn sync(&self) -> sediment_storage::Result<()> {
            self.0.sync()
        }
        fn lock(&self) -> sediment_storage::Result<()> {
            self.0.lock()
        }
        fn unlock(&self) -> sediment_storage::Result<()> {
            self.0.unlock()
        }
        fn close(&self) -> sediment_storage::Result<()> {
            self.0.close()
        }
        fn read_view(&self) -> sediment_storage::Result<Arc<dyn SegmentDirectory>> {
            self.0.read_view()
        }
        fn backend_name(&self) -> &'static str {
            "no-commit"
        }
    }

    #[test]
    fn test_failed_commit_reports_commit_error_when_cleanup_fails() {
        let dir = TempDir::new().unwrap();
        let directory = Arc::new(NoCommitDirectory(CompressedDirectory::new(
            dir.path().join("idx"),
            CompressionAlgorithm::Lz4,
        )));
        let writer = SegmentWriter::open("idx", directory, None).unwrap();

        let err = writer
            .add_segment(&b"orphan".to_vec(), 0, 0, &CancellationToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("snapshot"), "{}", err);
        assert!(writer.segments().is_empty());
        writer.close().unwrap();
    }

    #[test]
    fn test_historical_reader_filters_by_time() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let writer = SegmentWriter::open("idx", directory(&dir), None).unwrap();
        writer.add_segment(&b"a".to_vec(), 100, 199, &cancel).unwrap();
        writer.add_segment(&b"b".to_vec(), 200, 299, &cancel).unwrap();
        writer.add_segment(&b"c".to_vec(), 300, 399, &cancel).unwrap();
        writer.close().unwrap();

        let reader =
            SegmentReader::open_historical("idx", directory(&dir), None, 250, 320).unwrap();
        let ranges: Vec<_> = reader.segments().iter().map(|s| s.time_min).collect();
        assert_eq!(ranges, vec![200, 300]);

        let all = SegmentReader::open_historical("idx", directory(&dir), None, 0, 0).unwrap();
        assert_eq!(all.segments().len(), 3);

        let tail = SegmentReader::open_historical("idx", directory(&dir), None, 290, 0).unwrap();
        assert_eq!(tail.segments().len(), 2);
    }

    #[test]
    fn test_historical_reader_on_missing_index_fails() {
        let dir = TempDir::new().unwrap();
        let err = SegmentReader::open_historical("idx", directory(&dir), None, 0, 0).unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::Config(_))
        ));
    }

    #[test]
    fn test_closed_writer_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let writer = SegmentWriter::open("idx", directory(&dir), None).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(writer.is_closed());
        assert!(writer
            .add_segment(&b"x".to_vec(), 0, 0, &CancellationToken::new())
            .is_err());
        assert!(writer.reader().is_err());
    }

    #[test]
    fn test_second_writer_on_locked_directory_fails() {
        let dir = TempDir::new().unwrap();
        let first = SegmentWriter::open("idx", directory(&dir), None).unwrap();
        let err = SegmentWriter::open("idx", directory(&dir), None).unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::Locked(_))
        ));
        first.close().unwrap();
        SegmentWriter::open("idx", directory(&dir), None)
            .unwrap()
            .close()
            .unwrap();
    }
}
