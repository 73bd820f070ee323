//! The write side of the stream cache: a composite stream with a
//! file-backed prefix and a memory-backed overflow tail.

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::PathBuf,
};

use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamState {
    Writing,
    Committed,
    Aborted,
}

/// An in-flight cache entry produced by [`Cache::add`].
///
/// Writes land in a temp file under the cache's `tmp/` directory;
/// once the file cannot be written to (or could not be created at
/// all), subsequent bytes spill into a memory tail and the stream can
/// no longer be committed. An uncommitted stream unlinks its temp
/// file when dropped.
///
/// [`Cache::add`]: super::Cache::add
pub struct CacheStream {
    pub(super) key: String,
    pub(super) final_path: PathBuf,
    pub(super) temp_path: Option<PathBuf>,
    pub(super) file: Option<File>,
    pub(super) overflow: Vec<u8>,
    state: StreamState,
}

impl CacheStream {
    pub(super) fn new(
        key: String,
        final_path: PathBuf,
        temp_path: Option<PathBuf>,
        file: Option<File>,
    ) -> Self {
        Self {
            key,
            final_path,
            temp_path,
            file,
            overflow: Vec::new(),
            state: StreamState::Writing,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Mark the stream so its temp file is unlinked on finalization.
    pub fn abort(&mut self) {
        self.state = StreamState::Aborted;
    }

    /// Commit the entry: succeeds iff everything landed on disk and
    /// the flush succeeded, atomically renaming the temp into its
    /// final path and returning a read-only handle on it.
    ///
    /// On failure the payload is still returned as a [`CacheReader`]
    /// over whatever was written; the temp file is unlinked once the
    /// reader is dropped.
    pub fn commit(mut self) -> Result<File, CacheReader> {
        let flushed = match self.file.as_mut() {
            Some(file) => file.flush().and_then(|()| file.sync_all()).is_ok(),
            None => false,
        };

        if flushed && self.overflow.is_empty() {
            if let Some(temp_path) = &self.temp_path {
                if let Some(parent) = self.final_path.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if fs::rename(temp_path, &self.final_path).is_ok() {
                    if let Ok(file) = File::open(&self.final_path) {
                        self.state = StreamState::Committed;
                        return Ok(file);
                    }
                }
            }
        }

        warn!("cannot commit cache entry {}", self.key);
        self.state = StreamState::Committed; // the reader owns cleanup now
        Err(CacheReader::new(
            self.temp_path.take(),
            self.file.take(),
            std::mem::take(&mut self.overflow),
        ))
    }
}

impl Write for CacheStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.overflow.is_empty() {
            if let Some(file) = self.file.as_mut() {
                match file.write(buf) {
                    Ok(n) => return Ok(n),
                    Err(err) => {
                        // from here on everything spills to memory
                        warn!("cache temp write failed, spilling to memory: {err}");
                    }
                }
            }
        }

        self.overflow.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for CacheStream {
    fn drop(&mut self) {
        if self.state != StreamState::Committed {
            if let Some(temp_path) = &self.temp_path {
                let _ = fs::remove_file(temp_path);
            }
        }
    }
}

/// Read-only access to the payload of a failed commit: the on-disk
/// prefix chained with the memory overflow.
#[derive(Debug)]
pub struct CacheReader {
    temp_path: Option<PathBuf>,
    file: Option<File>,
    overflow: io::Cursor<Vec<u8>>,
    file_done: bool,
}

impl CacheReader {
    fn new(temp_path: Option<PathBuf>, file: Option<File>, overflow: Vec<u8>) -> Self {
        // reopen the temp so reads start at the beginning
        let file = temp_path.as_ref().and_then(|path| File::open(path).ok()).or(file);
        Self {
            temp_path,
            file,
            overflow: io::Cursor::new(overflow),
            file_done: false,
        }
    }
}

impl Read for CacheReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.file_done {
            if let Some(file) = self.file.as_mut() {
                let n = file.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
            }
            self.file_done = true;
        }

        self.overflow.read(buf)
    }
}

impl Drop for CacheReader {
    fn drop(&mut self) {
        if let Some(temp_path) = &self.temp_path {
            let _ = fs::remove_file(temp_path);
        }
    }
}
