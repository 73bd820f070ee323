//! # Offline journal
//!
//! An append-only replay log of deferred operations, owned by a
//! folder. The folder (or store) supplies a [`JournalCodec`] that
//! knows how to load, write and play its own entry type; the journal
//! itself only manages the queue and its on-disk file.
//!
//! [`OfflineJournal::write`] fsyncs before returning, so a replay
//! after a crash sees every queued operation.

use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Write},
    path::PathBuf,
};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};

/// Entry semantics for one journal: binary codec plus the replay
/// action.
#[async_trait]
pub trait JournalCodec: Send + Sync {
    type Entry: Send + Sync;

    /// Decode the next entry; `Ok(None)` at end of file.
    fn load(&self, r: &mut dyn Read) -> io::Result<Option<Self::Entry>>;

    fn write(&self, w: &mut dyn Write, entry: &Self::Entry) -> io::Result<()>;

    /// Perform the deferred operation.
    async fn play(&self, entry: &Self::Entry) -> Result<()>;
}

pub struct OfflineJournal<C: JournalCodec> {
    path: PathBuf,
    codec: C,
    queue: VecDeque<C::Entry>,
}

impl<C: JournalCodec> OfflineJournal<C> {
    /// Open a journal, loading any entries a previous session left
    /// queued.
    pub fn new(path: impl Into<PathBuf>, codec: C) -> Result<Self> {
        let path = path.into();
        let mut queue = VecDeque::new();

        match File::open(&path) {
            Ok(file) => {
                let mut r = BufReader::new(file);
                while let Some(entry) = codec.load(&mut r)? {
                    queue.push_back(entry);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        Ok(Self { path, codec, queue })
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue a deferred operation. Call [`OfflineJournal::write`] to
    /// persist it.
    pub fn add(&mut self, entry: C::Entry) {
        self.queue.push_back(entry);
    }

    /// Persist the queue: the file is rewritten and fsynced.
    pub fn write(&self) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        let mut w = BufWriter::new(file);

        for entry in &self.queue {
            self.codec.write(&mut w, entry)?;
        }

        w.flush()?;
        w.get_ref().sync_all()?;

        Ok(())
    }

    /// Play all queued entries in order. Each successful play removes
    /// its entry; a failing play leaves the entry queued. The first
    /// error is preserved and returned after the whole queue has been
    /// attempted, and the file is rewritten either way.
    pub async fn replay(&mut self) -> Result<()> {
        let mut kept: VecDeque<C::Entry> = VecDeque::new();
        let mut first_err: Option<Error> = None;

        while let Some(entry) = self.queue.pop_front() {
            match self.codec.play(&entry).await {
                Ok(()) => {}
                Err(err) => {
                    debug!("journal entry failed to replay, keeping it queued: {err}");
                    first_err.get_or_insert(err);
                    kept.push_back(entry);
                }
            }
        }

        self.queue = kept;
        self.write()?;

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        sync::atomic::{AtomicU32, Ordering},
    };

    use async_trait::async_trait;
    use tempfile::tempdir;

    use crate::{
        error::{Error, Result},
        summary::codec::{read_string, write_string},
    };

    use super::{JournalCodec, OfflineJournal};

    /// A toy journal: entries are strings, entries containing "bad"
    /// fail to play.
    struct TestCodec {
        played: AtomicU32,
    }

    #[async_trait]
    impl JournalCodec for TestCodec {
        type Entry = String;

        fn load(&self, r: &mut dyn Read) -> std::io::Result<Option<String>> {
            match read_string(r) {
                Ok(entry) => Ok(Some(entry)),
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
                Err(err) => Err(err),
            }
        }

        fn write(&self, w: &mut dyn Write, entry: &String) -> std::io::Result<()> {
            write_string(w, entry)
        }

        async fn play(&self, entry: &String) -> Result<()> {
            if entry.contains("bad") {
                return Err(Error::ServiceUnavailable(entry.clone()));
            }
            self.played.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn codec() -> TestCodec {
        TestCodec {
            played: AtomicU32::new(0),
        }
    }

    #[tokio::test]
    async fn replay_keeps_failures_queued() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");

        let mut journal = OfflineJournal::new(&path, codec()).unwrap();
        journal.add("one".into());
        journal.add("bad apple".into());
        journal.add("two".into());
        journal.write().unwrap();

        let err = journal.replay().await.unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));
        assert_eq!(journal.len(), 1);
        assert_eq!(journal.codec.played.load(Ordering::SeqCst), 2);

        // the survivor is still on disk for the next session
        let reloaded = OfflineJournal::new(&path, codec()).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[tokio::test]
    async fn replay_of_clean_queue_empties_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");

        let mut journal = OfflineJournal::new(&path, codec()).unwrap();
        journal.add("one".into());
        journal.write().unwrap();
        journal.replay().await.unwrap();
        assert!(journal.is_empty());

        let reloaded = OfflineJournal::new(&path, codec()).unwrap();
        assert!(reloaded.is_empty());
    }
}
