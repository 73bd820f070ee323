//! # Folder summary
//!
//! The summary is the cached, on-disk index of a folder: one
//! [`MessageInfo`] record per message plus a versioned header with the
//! backing store's modification time and cached counts. Stores load it
//! on folder open, mutate it as messages come and go, and write it
//! back (atomically, temp + rename) on close or flush.
//!
//! The header load fails when the backing store has been modified
//! since the summary was written, which forces the owning folder to
//! rescan the store.

pub(crate) mod codec;

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use mail_parser::MessageParser;
use tracing::debug;

use crate::{
    envelope,
    error::{Error, Result},
    flag::Flags,
};

use self::codec::{
    read_i64, read_string, read_string_list, read_u32, write_i64, write_string,
    write_string_list, write_u32,
};

/// On-disk format version of the summary file.
const SUMMARY_VERSION: u32 = 1;

/// Version of the flags schema encoded in the records.
const FLAGS_VERSION: u32 = 1;

/// A single message record of a folder summary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageInfo {
    /// Stable identifier of the message within its folder.
    pub uid: String,
    pub flags: Flags,

    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    pub message_id: String,
    pub references: Vec<String>,

    /// Date header, UTC epoch seconds.
    pub date_sent: i64,
    /// Delivery date from the Received header, UTC epoch seconds.
    pub date_received: i64,

    /// Message size in octets.
    pub size: u32,
    pub lines: u32,

    /// Byte offset of the `From ` delimiter line (mbox only, -1
    /// otherwise).
    pub frompos: i64,
    /// Byte offset of the `X-Spruce` header value (mbox only, -1 when
    /// absent).
    pub flagspos: i64,
}

impl Default for MessageInfo {
    fn default() -> Self {
        Self {
            uid: String::new(),
            flags: Flags::empty(),
            from: String::new(),
            to: String::new(),
            cc: String::new(),
            subject: String::new(),
            message_id: String::new(),
            references: Vec::new(),
            date_sent: 0,
            date_received: 0,
            size: 0,
            lines: 0,
            frompos: -1,
            flagspos: -1,
        }
    }
}

impl MessageInfo {
    /// Build a record from raw message bytes: envelope and temporal
    /// fields come from the headers, size and lines from the bytes.
    /// The uid is left empty for the store to assign.
    pub fn from_message(raw: &[u8]) -> Self {
        let mut info = MessageInfo {
            size: raw.len() as u32,
            lines: raw.iter().filter(|&&b| b == b'\n').count() as u32,
            ..Default::default()
        };

        match MessageParser::new().parse(raw) {
            Some(msg) => {
                info.from = envelope::address_list_string(msg.from());
                info.to = envelope::address_list_string(msg.to());
                info.cc = envelope::address_list_string(msg.cc());
                info.subject = msg.subject().unwrap_or_default().to_owned();
                info.message_id = msg
                    .message_id()
                    .map(|id| format!("<{id}>"))
                    .unwrap_or_default();
                info.date_sent = msg
                    .date()
                    .map(envelope::datetime_to_epoch)
                    .unwrap_or_default();
            }
            None => {
                debug!("cannot parse message headers, recording size only");
            }
        }

        info.references = envelope::msg_references(raw);
        info.date_received = envelope::received_date(raw).unwrap_or_default();

        info
    }

    /// Binary-encode this record. Every field is preserved:
    /// length-prefixed strings, explicit integer widths.
    pub fn save(&self, w: &mut impl Write) -> io::Result<()> {
        write_string(w, &self.uid)?;
        write_u32(w, self.flags.bits())?;
        write_string(w, &self.from)?;
        write_string(w, &self.to)?;
        write_string(w, &self.cc)?;
        write_string(w, &self.subject)?;
        write_string(w, &self.message_id)?;
        write_string_list(w, &self.references)?;
        write_i64(w, self.date_sent)?;
        write_i64(w, self.date_received)?;
        write_u32(w, self.size)?;
        write_u32(w, self.lines)?;
        write_i64(w, self.frompos)?;
        write_i64(w, self.flagspos)
    }

    /// Decode a record written by [`MessageInfo::save`].
    pub fn load(r: &mut impl Read) -> io::Result<Self> {
        Ok(MessageInfo {
            uid: read_string(r)?,
            flags: Flags::from_bits_truncate(read_u32(r)?),
            from: read_string(r)?,
            to: read_string(r)?,
            cc: read_string(r)?,
            subject: read_string(r)?,
            message_id: read_string(r)?,
            references: read_string_list(r)?,
            date_sent: read_i64(r)?,
            date_received: read_i64(r)?,
            size: read_u32(r)?,
            lines: read_u32(r)?,
            frompos: read_i64(r)?,
            flagspos: read_i64(r)?,
        })
    }
}

/// Cached counts stored in the summary header, available without
/// loading the records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SummaryCounts {
    pub total: u32,
    pub unread: u32,
    pub deleted: u32,
}

/// The in-memory folder summary plus its persistence.
#[derive(Debug)]
pub struct FolderSummary {
    /// Path of the summary file itself.
    path: PathBuf,
    /// Path of the backing store (Maildir directory or mbox file) the
    /// staleness check compares against.
    backing: PathBuf,

    /// Backing store mtime at the moment the summary was last saved.
    timestamp: i64,
    /// Next sequence number for stores that allocate integer uids.
    next_uid: u32,
    counts: SummaryCounts,

    messages: Vec<MessageInfo>,
    index: HashMap<String, usize>,

    loaded: bool,
    touched: bool,
}

impl FolderSummary {
    pub fn new(path: impl Into<PathBuf>, backing: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backing: backing.into(),
            timestamp: 0,
            next_uid: 1,
            counts: SummaryCounts::default(),
            messages: Vec::new(),
            index: HashMap::new(),
            loaded: false,
            touched: false,
        }
    }

    /// Retarget the summary after a folder rename.
    pub fn set_paths(&mut self, path: impl Into<PathBuf>, backing: impl Into<PathBuf>) {
        self.path = path.into();
        self.backing = backing.into();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Current counts: computed from the records when they are in
    /// memory, otherwise the cached header values.
    pub fn counts(&self) -> SummaryCounts {
        if self.loaded {
            self.compute_counts()
        } else {
            self.counts
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Mark the summary as needing a rewrite even if no record
    /// changed.
    pub fn touch(&mut self) {
        self.touched = true;
    }

    pub fn is_touched(&self) -> bool {
        self.touched
    }

    /// Allocate the next sequence uid.
    pub fn next_uid(&mut self) -> u32 {
        let uid = self.next_uid;
        self.next_uid += 1;
        self.touched = true;
        uid
    }

    pub fn count(&self) -> usize {
        self.messages.len()
    }

    pub fn index(&self, i: usize) -> Option<&MessageInfo> {
        self.messages.get(i)
    }

    pub fn uid(&self, uid: &str) -> Option<&MessageInfo> {
        self.index.get(uid).map(|&i| &self.messages[i])
    }

    pub fn uid_mut(&mut self, uid: &str) -> Option<&mut MessageInfo> {
        let i = *self.index.get(uid)?;
        self.touched = true;
        Some(&mut self.messages[i])
    }

    pub fn messages(&self) -> &[MessageInfo] {
        &self.messages
    }

    pub fn uids(&self) -> Vec<String> {
        self.messages.iter().map(|info| info.uid.clone()).collect()
    }

    /// Append a record; a record with the same uid is replaced.
    pub fn add(&mut self, info: MessageInfo) {
        self.touched = true;
        match self.index.get(&info.uid) {
            Some(&i) => self.messages[i] = info,
            None => {
                self.index.insert(info.uid.clone(), self.messages.len());
                self.messages.push(info);
            }
        }
    }

    pub fn remove(&mut self, uid: &str) -> Option<MessageInfo> {
        let i = self.index.remove(uid)?;
        let info = self.messages.remove(i);
        self.reindex();
        self.touched = true;
        Some(info)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.index.clear();
        self.loaded = false;
        self.touched = true;
    }

    fn reindex(&mut self) {
        self.index = self
            .messages
            .iter()
            .enumerate()
            .map(|(i, info)| (info.uid.clone(), i))
            .collect();
    }

    fn compute_counts(&self) -> SummaryCounts {
        let mut counts = SummaryCounts {
            total: self.messages.len() as u32,
            ..Default::default()
        };
        for info in &self.messages {
            if !info.flags.contains(Flags::SEEN) {
                counts.unread += 1;
            }
            if info.flags.contains(Flags::DELETED) {
                counts.deleted += 1;
            }
        }
        counts
    }

    /// Modification time of the backing store, in epoch seconds.
    pub fn backing_mtime(&self) -> io::Result<i64> {
        let mtime = fs::metadata(&self.backing)?.modified()?;
        Ok(mtime
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default())
    }

    fn read_header(&mut self, r: &mut impl Read) -> Result<()> {
        let version = read_u32(r)?;
        let flags_version = read_u32(r)?;
        if version != SUMMARY_VERSION || flags_version != FLAGS_VERSION {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "unknown summary format version",
            )));
        }

        self.timestamp = read_i64(r)?;
        self.next_uid = read_u32(r)?;
        self.counts = SummaryCounts {
            total: read_u32(r)?,
            unread: read_u32(r)?,
            deleted: read_u32(r)?,
        };

        Ok(())
    }

    /// Load only the header. Fails when the file is missing or
    /// malformed, or when the backing store's mtime is newer than the
    /// stored timestamp, in which case the caller must rescan.
    pub fn header_load(&mut self) -> Result<()> {
        let mut r = BufReader::new(File::open(&self.path)?);
        self.read_header(&mut r)?;

        if self.backing_mtime()? > self.timestamp {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "summary is older than the backing store",
            )));
        }

        Ok(())
    }

    /// Load the header and all records.
    pub fn load(&mut self) -> Result<()> {
        let mut r = BufReader::new(File::open(&self.path)?);
        self.read_header(&mut r)?;

        if self.backing_mtime()? > self.timestamp {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "summary is older than the backing store",
            )));
        }

        self.messages.clear();
        self.index.clear();
        for _ in 0..self.counts.total {
            let info = MessageInfo::load(&mut r)?;
            self.index.insert(info.uid.clone(), self.messages.len());
            self.messages.push(info);
        }

        self.loaded = true;
        self.touched = false;

        Ok(())
    }

    /// Drop all records and reload from disk.
    pub fn reload(&mut self) -> Result<()> {
        self.clear();
        self.load()
    }

    /// Write the summary to disk: temp file in the same directory,
    /// then atomic rename. The stored timestamp is the backing store's
    /// mtime observed now, so any later external mutation invalidates
    /// the summary.
    pub fn save(&mut self) -> Result<()> {
        self.timestamp = self.backing_mtime().unwrap_or_default();
        self.counts = self.compute_counts();

        let tmp = self.path.with_extension("tmp");
        {
            let mut w = BufWriter::new(File::create(&tmp)?);

            write_u32(&mut w, SUMMARY_VERSION)?;
            write_u32(&mut w, FLAGS_VERSION)?;
            write_i64(&mut w, self.timestamp)?;
            write_u32(&mut w, self.next_uid)?;
            write_u32(&mut w, self.counts.total)?;
            write_u32(&mut w, self.counts.unread)?;
            write_u32(&mut w, self.counts.deleted)?;

            for info in &self.messages {
                info.save(&mut w)?;
            }

            w.flush()?;
            w.get_ref().sync_all()?;
        }

        if let Err(err) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }

        self.loaded = true;
        self.touched = false;

        Ok(())
    }

    /// Mark the summary as freshly scanned from the backing store.
    pub fn set_scanned(&mut self) {
        self.loaded = true;
    }
}
