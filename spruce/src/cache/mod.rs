//! # Stream cache
//!
//! A content-addressed disk cache for opaque streams, keyed by 8-bit
//! strings. Entries live at `<root>/<hh>/<key>` where `<hh>` is a
//! two-hex-digit bucket derived from the key hash; in-flight writes
//! are isolated under `<root>/tmp/` and only an atomic rename
//! publishes them. Expiration walks the buckets and drops the files
//! with the oldest access times until the cache fits its cap again;
//! symlinked entries are never expired (user pinning).

mod stream;

use std::{
    fs::{self, File},
    io,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::error::{Error, Result};

#[doc(inline)]
pub use self::stream::{CacheReader, CacheStream};

/// GLib-style fold hash; only the low bits are used for bucketing.
fn key_hash(key: &str) -> u32 {
    let mut hash: u32 = 5381;
    for b in key.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

fn is_bucket_name(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

pub struct Cache {
    basedir: PathBuf,
    /// Total size cap in bytes enforced by [`Cache::expire`].
    limit: u64,
}

impl Cache {
    pub fn new(basedir: impl Into<PathBuf>, limit: u64) -> Result<Self> {
        let cache = Self {
            basedir: basedir.into(),
            limit,
        };

        fs::create_dir_all(cache.tmp_dir())?;
        cache.clear_tmp();

        Ok(cache)
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    fn tmp_dir(&self) -> PathBuf {
        self.basedir.join("tmp")
    }

    fn bucket(&self, key: &str) -> PathBuf {
        self.basedir.join(format!("{:02x}", key_hash(key) & 0x3f))
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.bucket(key).join(key)
    }

    /// Leftover temp files from interrupted writers.
    fn clear_tmp(&self) {
        let entries = match fs::read_dir(self.tmp_dir()) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let _ = fs::remove_file(entry.path());
        }
    }

    /// Start writing a new entry. When the temp file cannot be
    /// created the stream is entirely memory-backed (and can never be
    /// committed).
    pub fn add(&self, key: &str) -> CacheStream {
        let temp_path = self.tmp_dir().join(key);
        let final_path = self.entry_path(key);

        match File::create(&temp_path) {
            Ok(file) => CacheStream::new(key.to_owned(), final_path, Some(temp_path), Some(file)),
            Err(err) => {
                warn!("cannot create cache temp for {key}: {err}");
                CacheStream::new(key.to_owned(), final_path, None, None)
            }
        }
    }

    /// Open a committed entry read-only.
    pub fn get(&self, key: &str) -> Result<File> {
        match File::open(self.entry_path(key)) {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(Error::NoSuchMessage(key.to_owned()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Move an entry to a new key. A symlinked entry is re-linked to
    /// its original target rather than to the symlink itself.
    pub fn rekey(&self, old: &str, new: &str) -> Result<()> {
        let old_path = self.entry_path(old);
        let new_path = self.entry_path(new);

        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let meta = fs::symlink_metadata(&old_path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                Error::NoSuchMessage(old.to_owned())
            } else {
                Error::Io(err)
            }
        })?;

        if meta.file_type().is_symlink() {
            let target = fs::read_link(&old_path)?;
            std::os::unix::fs::symlink(target, &new_path)?;
            fs::remove_file(&old_path)?;
        } else {
            fs::rename(&old_path, &new_path)?;
        }

        Ok(())
    }

    /// Expire old entries: when the total size of the cache exceeds
    /// the cap, the oldest-accessed files go first. Symlinks are
    /// exempt and never traversed.
    pub fn expire(&self) -> Result<()> {
        struct EntryInfo {
            path: PathBuf,
            atime: i64,
            size: u64,
        }

        let dir = match fs::read_dir(&self.basedir) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut total: u64 = 0;
        let mut entries: Vec<EntryInfo> = Vec::new();

        for bucket in dir {
            let bucket = bucket?;
            let name = bucket.file_name().to_string_lossy().into_owned();
            if !is_bucket_name(&name) {
                continue;
            }
            if !bucket.file_type()?.is_dir() {
                continue;
            }

            for entry in fs::read_dir(bucket.path())? {
                let entry = entry?;
                let meta = match fs::symlink_metadata(entry.path()) {
                    Ok(meta) => meta,
                    Err(_) => continue,
                };
                if meta.file_type().is_symlink() || !meta.is_file() {
                    continue;
                }

                total += meta.size();
                entries.push(EntryInfo {
                    path: entry.path(),
                    atime: meta.atime(),
                    size: meta.size(),
                });
            }
        }

        if total <= self.limit {
            return Ok(());
        }

        entries.sort_by_key(|entry| entry.atime);

        let mut failed = None;
        for entry in entries {
            if total <= self.limit {
                break;
            }

            match fs::remove_file(&entry.path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!("cannot expire {}: {err}", entry.path.display());
                    failed.get_or_insert(err);
                    continue;
                }
            }

            debug!("expired {}", entry.path.display());
            total = total.saturating_sub(entry.size);
        }

        match failed {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Drop every committed entry, keeping in-flight temp files.
    pub fn expire_all(&self) -> Result<()> {
        let dir = match fs::read_dir(&self.basedir) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut first_err = None;
        for bucket in dir {
            let bucket = bucket?;
            let name = bucket.file_name().to_string_lossy().into_owned();
            if !is_bucket_name(&name) {
                continue;
            }

            for entry in fs::read_dir(bucket.path())? {
                let entry = entry?;
                match fs::remove_file(entry.path()) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        first_err.get_or_insert(err);
                    }
                }
            }
        }

        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Drop one entry.
    pub fn expire_key(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove the entire cache from disk.
    pub fn delete(self) -> Result<()> {
        match fs::remove_dir_all(&self.basedir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Move the cache to a new root directory.
    pub fn rename(&mut self, new_root: impl Into<PathBuf>) -> Result<()> {
        let new_root = new_root.into();
        fs::rename(&self.basedir, &new_root)?;
        self.basedir = new_root;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use tempfile::tempdir;

    use super::Cache;

    #[test]
    fn buckets_are_two_hex_digits() {
        let dir = tempdir().unwrap();
        let cache = Cache::new(dir.path().join("cache"), 1024).unwrap();

        let mut stream = cache.add("some-key");
        stream.write_all(b"payload").unwrap();
        stream.commit().unwrap();

        let bucket = cache.bucket("some-key");
        let name = bucket.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name.len(), 2);
        assert!(bucket.join("some-key").is_file());
    }

    #[test]
    fn commit_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let cache = Cache::new(dir.path().join("cache"), 1024).unwrap();

        let mut stream = cache.add("k");
        stream.write_all(b"hello cache").unwrap();
        let mut committed = stream.commit().unwrap();

        let mut payload = String::new();
        committed.read_to_string(&mut payload).unwrap();
        assert_eq!(payload, "hello cache");

        let mut fetched = String::new();
        cache.get("k").unwrap().read_to_string(&mut fetched).unwrap();
        assert_eq!(fetched, "hello cache");
    }

    #[test]
    fn dropped_stream_unlinks_temp() {
        let dir = tempdir().unwrap();
        let cache = Cache::new(dir.path().join("cache"), 1024).unwrap();

        {
            let mut stream = cache.add("k2");
            stream.write_all(b"never committed").unwrap();
        }

        assert!(matches!(
            cache.get("k2"),
            Err(crate::error::Error::NoSuchMessage(_))
        ));
        assert!(!dir.path().join("cache/tmp/k2").exists());
    }

    #[test]
    fn rekey_moves_entries() {
        let dir = tempdir().unwrap();
        let cache = Cache::new(dir.path().join("cache"), 1024).unwrap();

        let mut stream = cache.add("old");
        stream.write_all(b"data").unwrap();
        stream.commit().unwrap();

        cache.rekey("old", "new").unwrap();
        assert!(cache.get("old").is_err());

        let mut fetched = String::new();
        cache.get("new").unwrap().read_to_string(&mut fetched).unwrap();
        assert_eq!(fetched, "data");
    }

    #[test]
    fn expire_removes_oldest_first() {
        let dir = tempdir().unwrap();
        let cache = Cache::new(dir.path().join("cache"), 10).unwrap();

        for (key, body) in [("a", "aaaaaaaa"), ("b", "bbbbbbbb")] {
            let mut stream = cache.add(key);
            stream.write_all(body.as_bytes()).unwrap();
            stream.commit().unwrap();
        }

        // 16 bytes total against a 10 byte cap: at least one entry
        // has to go
        cache.expire().unwrap();
        let survivors = ["a", "b"]
            .iter()
            .filter(|key| cache.get(key).is_ok())
            .count();
        assert!(survivors < 2);
    }
}
