//! Compressed filesystem segment directory.
//!
//! Each segment is a single file named `"{id:012x}{kind}"` holding the
//! segment bytes encoded with the configured [`CompressionAlgorithm`].
//!
//! # Locking
//!
//! - `persist` holds an exclusive advisory lock on the file it writes
//! - `load` holds a shared lock until the [`LoadedSegment`] is released
//! - `lock`/`unlock` manage a PID file (`bluge.pid`) that keeps a second
//!   writer process out of the directory

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{buffer_source, decode_id, encode_id, LoadedSegment, SegmentDirectory, SegmentSource};
use crate::codec::CompressionAlgorithm;
use crate::error::{Result, StorageError};

/// Name of the directory lock file.
pub const PID_FILENAME: &str = "bluge.pid";

#[cfg(unix)]
const NEW_DIR_MODE: u32 = 0o700;
#[cfg(unix)]
const NEW_FILE_MODE: u32 = 0o600;

/// Segment directory storing one compressed file per segment.
pub struct CompressedDirectory {
    path: PathBuf,
    compression: CompressionAlgorithm,
    pid: Mutex<Option<File>>,
}

impl CompressedDirectory {
    pub fn new(path: impl Into<PathBuf>, compression: CompressionAlgorithm) -> Self {
        Self {
            path: path.into(),
            compression,
            pid: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn compression(&self) -> CompressionAlgorithm {
        self.compression
    }

    /// File name for a segment.
    pub fn file_name(kind: &str, id: u64) -> String {
        format!("{}{}", encode_id(id), kind)
    }

    fn segment_path(&self, kind: &str, id: u64) -> PathBuf {
        self.path.join(Self::file_name(kind, id))
    }

    fn open_rw(path: &Path) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.create(true).read(true).write(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(NEW_FILE_MODE);
        }
        options.open(path)
    }

    /// Write the compressed segment into an already locked file.
    fn write_segment(
        &self,
        file: &mut File,
        path: &Path,
        source: &dyn SegmentSource,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        file.set_len(0)
            .map_err(|e| StorageError::io("persist", path, e))?;

        let buf = buffer_source(source, cancel, &path.display().to_string())?;
        let raw_len = buf.len();

        let mut writer = io::BufWriter::new(&mut *file);
        let written = self.compression.compress(&mut writer, &buf)?;
        writer
            .flush()
            .map_err(|e| StorageError::io("persist", path, e))?;
        drop(writer);

        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled(format!("persist {}", path.display())));
        }
        file.sync_all()
            .map_err(|e| StorageError::io("persist", path, e))?;

        debug!(
            path = %path.display(),
            raw = raw_len,
            compressed = written,
            algorithm = %self.compression,
            "persisted segment"
        );
        Ok(written)
    }
}

impl std::fmt::Debug for CompressedDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedDirectory")
            .field("path", &self.path)
            .field("compression", &self.compression)
            .field("locked", &self.pid.lock().is_some())
            .finish()
    }
}

impl SegmentDirectory for CompressedDirectory {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn setup(&self, read_only: bool) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if read_only {
                    return Err(StorageError::Config(format!(
                        "read-only open of missing directory {}",
                        self.path.display()
                    )));
                }
                let mut builder = fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::DirBuilderExt;
                    builder.mode(NEW_DIR_MODE);
                }
                builder
                    .create(&self.path)
                    .map_err(|e| StorageError::io("setup", &self.path, e))
            }
            Err(e) => Err(StorageError::io("setup", &self.path, e)),
        }
    }

    fn list(&self, kind: &str) -> Result<Vec<u64>> {
        let entries = fs::read_dir(&self.path).map_err(|e| StorageError::io("list", &self.path, e))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io("list", &self.path, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(base) = name.strip_suffix(kind) else {
                continue;
            };
            let id = decode_id(base).ok_or_else(|| {
                StorageError::Corrupt(format!("error parsing identifier '{}' in {}", base, name))
            })?;
            ids.push(id);
        }

        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    fn load(&self, kind: &str, id: u64) -> Result<LoadedSegment> {
        let path = self.segment_path(kind, id);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(StorageError::io("load", &path, e)),
        };
        FileExt::lock_shared(&file).map_err(|e| StorageError::io("load", &path, e))?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .map_err(|e| StorageError::io("load", &path, e))?;
        let data = self.compression.decompress(&raw).map_err(|e| {
            StorageError::Compression(format!("error creating data from {}: {}", path.display(), e))
        })?;

        Ok(LoadedSegment::with_file_guard(data, file))
    }

    #[instrument(skip(self, source, cancel), fields(path = %self.path.display()))]
    fn persist(
        &self,
        kind: &str,
        id: u64,
        source: &dyn SegmentSource,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let path = self.segment_path(kind, id);
        let mut file = Self::open_rw(&path).map_err(|e| StorageError::io("persist", &path, e))?;
        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            // The file belongs to whoever holds the lock; leave it alone.
            return Err(StorageError::Locked(format!("{}: {}", path.display(), e)));
        }

        match self.write_segment(&mut file, &path, source, cancel) {
            Ok(_) => {
                drop(file);
                Ok(())
            }
            Err(err) => {
                drop(file);
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), "failed to remove partial segment: {}", e);
                }
                Err(err)
            }
        }
    }

    fn remove(&self, kind: &str, id: u64) -> Result<()> {
        let path = self.segment_path(kind, id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io("remove", &path, e)),
        }
    }

    fn stats(&self) -> (u64, u64) {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.path.display(), "failed to read directory for stats: {}", e);
                return (0, 0);
            }
        };

        let mut files = 0u64;
        let mut bytes = 0u64;
        for entry in entries.flatten() {
            match entry.metadata() {
                Ok(meta) if meta.is_file() => {
                    files += 1;
                    bytes += meta.len();
                }
                Ok(_) => {}
                Err(e) => warn!(path = %entry.path().display(), "failed to stat: {}", e),
            }
        }
        (files, bytes)
    }

    fn sync(&self) -> Result<()> {
        let dir = File::open(&self.path).map_err(|e| StorageError::io("sync", &self.path, e))?;
        dir.sync_all()
            .map_err(|e| StorageError::io("sync", &self.path, e))
    }

    fn lock(&self) -> Result<()> {
        let pid_path = self.path.join(PID_FILENAME);
        let mut pid = self.pid.lock();
        if pid.is_some() {
            return Err(StorageError::Locked(format!(
                "{} already locked by this handle",
                self.path.display()
            )));
        }

        let mut file =
            Self::open_rw(&pid_path).map_err(|e| StorageError::io("lock", &pid_path, e))?;
        FileExt::try_lock_exclusive(&file).map_err(|e| {
            StorageError::Locked(format!(
                "unable to obtain exclusive access to {}: {}",
                self.path.display(),
                e
            ))
        })?;
        file.set_len(0)
            .map_err(|e| StorageError::io("lock", &pid_path, e))?;
        writeln!(file, "{}", std::process::id())
            .map_err(|e| StorageError::io("lock", &pid_path, e))?;
        file.sync_all()
            .map_err(|e| StorageError::io("lock", &pid_path, e))?;

        *pid = Some(file);
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        let Some(file) = self.pid.lock().take() else {
            return Ok(());
        };
        let pid_path = self.path.join(PID_FILENAME);
        drop(file);
        match fs::remove_file(&pid_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io("unlock", &pid_path, e)),
        }
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn read_view(&self) -> Result<Arc<dyn SegmentDirectory>> {
        Ok(Arc::new(Self::new(self.path.clone(), self.compression)))
    }

    fn backend_name(&self) -> &'static str {
        "compressed"
    }
}
