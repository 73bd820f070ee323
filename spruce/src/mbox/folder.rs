//! The mbox folder: a single `From `-delimited file, flags persisted
//! in a per-message `X-Spruce` header, expunge by rewriting to a
//! sibling temp file.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    process,
    sync::{Arc, Mutex, Weak},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use mail_parser::MessageParser;
use tracing::{debug, warn};

use crate::{
    envelope,
    error::{Error, Result},
    flag::Flags,
    folder::{Folder, FolderKind, FolderMode, RenameSignal, RenamedCallback},
    search::folder::{FolderSearch, SearchSource},
    store::Store,
    summary::{FolderSummary, MessageInfo, SummaryCounts},
};

use super::{
    store::{MboxStore, RESERVED_SUFFIXES},
    summary as mbox_summary,
};

/// Advisory file locking seam.
///
/// The discipline is fixed even though the implementation is not:
/// append and expunge take the write lock, get_message takes the read
/// lock. Currently both are no-ops; dot-locks or `flock` can be slotted
/// in here without touching the folder logic.
struct MboxLock;

impl MboxLock {
    fn read(_path: &Path) -> Result<Self> {
        Ok(Self)
    }

    fn write(_path: &Path) -> Result<Self> {
        Ok(Self)
    }
}

/// Synthesize a `From ` delimiter line for a message being appended.
///
/// Address preference: Sender, then From, then `postmaster@localhost`.
/// Date preference: the last `;` segment of the Received header, then
/// the Date header, then the current time; rendered as the declared
/// wall-clock time.
fn create_from_line(message: &[u8]) -> String {
    let parsed = MessageParser::new().parse(message);

    let sender = parsed
        .as_ref()
        .and_then(|msg| {
            envelope::first_mailbox(msg.sender()).or_else(|| envelope::first_mailbox(msg.from()))
        })
        .unwrap_or_else(|| "postmaster@localhost".to_owned());

    let date: Option<NaiveDateTime> = envelope::header_value(message, "Received")
        .and_then(|received| {
            let date = received.rsplit(';').next()?.to_owned();
            envelope::parse_rfc2822(&date).map(|dt| dt.naive_local())
        })
        .or_else(|| {
            let dt = parsed.as_ref().and_then(|msg| msg.date().cloned())?;
            NaiveDate::from_ymd_opt(dt.year as i32, dt.month as u32, dt.day as u32)?
                .and_hms_opt(dt.hour as u32, dt.minute as u32, dt.second as u32)
        });
    let date = date.unwrap_or_else(|| Utc::now().naive_utc());

    format!("From {sender} {}\n", date.format("%a %b %e %H:%M:%S %Y"))
}

struct State {
    name: String,
    full_name: String,
    path: PathBuf,
    kind: FolderKind,
    exists: bool,
    open: bool,
    mode: Option<FolderMode>,
    file: Option<File>,
    summary: Option<FolderSummary>,
    signal: RenameSignal,
}

impl State {
    fn summary_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{name}.summary"))
    }

    fn ensure_summary(&mut self) -> &mut FolderSummary {
        let path = self.path.clone();
        self.summary
            .get_or_insert_with(|| FolderSummary::new(Self::summary_path(&path), path.clone()))
    }

    /// (Re)open the mailbox fd, read-write with a read-only fallback
    /// for read-only filesystems.
    fn reopen_file(&mut self) -> Result<()> {
        match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => {
                self.file = Some(file);
                self.mode = Some(FolderMode::ReadWrite);
                Ok(())
            }
            Err(err)
                if err.kind() == io::ErrorKind::PermissionDenied
                    || err.raw_os_error() == Some(libc::EROFS) =>
            {
                self.file = Some(File::open(&self.path)?);
                self.mode = Some(FolderMode::ReadOnly);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn file(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            self.reopen_file()?;
        }
        self.file.as_mut().ok_or(Error::NotConnected)
    }
}

pub struct MboxFolder {
    store: Weak<MboxStore>,
    state: Mutex<State>,
    search: Mutex<FolderSearch>,
    parent_sub: Mutex<Option<(Weak<dyn Folder>, usize)>>,
}

impl MboxFolder {
    pub(crate) fn new(store: Weak<MboxStore>, full_name: &str) -> Result<Arc<Self>> {
        let (path, sbd) = match store.upgrade() {
            Some(store) => (
                store.build_path(full_name),
                store.sbd_path(full_name),
            ),
            None => return Err(Error::ServiceUnavailable("mbox store was dropped".into())),
        };

        let name = match full_name.rsplit_once('/') {
            Some((_, name)) => name.to_owned(),
            None if full_name.is_empty() => "Inbox".to_owned(),
            None => full_name.to_owned(),
        };

        let mut state = State {
            name,
            full_name: full_name.to_owned(),
            path: path.clone(),
            kind: FolderKind::empty(),
            exists: false,
            open: false,
            mode: None,
            file: None,
            summary: None,
            signal: RenameSignal::default(),
        };

        if full_name.is_empty() {
            // the top folder is the store root directory
            state.kind = FolderKind::CAN_HOLD_FOLDERS;
            state.exists = path.is_dir();
        } else {
            if path.is_file() {
                state.kind |= FolderKind::CAN_HOLD_MESSAGES;
                state.exists = true;

                let summary = state.ensure_summary();
                if let Err(err) = summary.header_load() {
                    debug!("no usable summary header for {full_name}: {err}");
                }
            }
            if sbd.is_dir() {
                state.kind |= FolderKind::CAN_HOLD_FOLDERS;
                state.exists = true;
            }
        }

        Ok(Arc::new(Self {
            store,
            state: Mutex::new(state),
            search: Mutex::new(FolderSearch::new()),
            parent_sub: Mutex::new(None),
        }))
    }

    pub(crate) fn set_parent_subscription(&self, parent: &Arc<dyn Folder>, token: usize) {
        *self.parent_sub.lock().unwrap() = Some((Arc::downgrade(parent), token));
    }

    fn store(&self) -> Result<Arc<MboxStore>> {
        self.store
            .upgrade()
            .ok_or_else(|| Error::ServiceUnavailable("mbox store was dropped".into()))
    }

    fn require_messages(state: &State) -> Result<()> {
        if !state.kind.contains(FolderKind::CAN_HOLD_MESSAGES) {
            return Err(Error::IllegalName(format!(
                "folder {} cannot hold messages",
                state.full_name
            )));
        }
        Ok(())
    }

    fn scan_summary(state: &mut State) -> Result<()> {
        let path = state.path.clone();
        let data = fs::read(&path)?;
        let summary = state.ensure_summary();
        mbox_summary::scan(&path, &data, summary)
    }

    /// Extract one message region from the mailbox image, by record.
    fn read_region(data: &[u8], summary: &FolderSummary, uid: &str) -> Result<(usize, Vec<u8>)> {
        let info = summary
            .uid(uid)
            .ok_or_else(|| Error::NoSuchMessage(uid.to_owned()))?;
        if info.frompos < 0 || info.frompos as usize >= data.len() {
            return Err(Error::NoSuchMessage(uid.to_owned()));
        }
        let start = info.frompos as usize;

        // records are kept in folder order, so the next record's
        // frompos bounds this message
        let mut end = data.len();
        let mut is_last = true;
        for other in summary.messages() {
            if other.frompos > info.frompos && (other.frompos as usize) < end {
                end = other.frompos as usize;
                is_last = false;
            }
        }

        let body = mbox_summary::region_body(data, start, end, is_last).to_vec();
        Ok((start, body))
    }

    fn close_inner(&self, state: &mut State, expunge: bool) -> Result<()> {
        if expunge {
            self.expunge_inner(state, None)?;
        }

        if state.kind.contains(FolderKind::CAN_HOLD_MESSAGES) {
            if state.mode == Some(FolderMode::ReadWrite) {
                let mut file = state.file()?.try_clone()?;
                if let Some(summary) = state.summary.as_mut() {
                    mbox_summary::sync_flags(&mut file, summary)?;
                }
            }
            if let Some(summary) = state.summary.as_mut() {
                summary.save()?;
            }
        }

        state.file = None;
        state.open = false;
        state.mode = None;

        Ok(())
    }

    fn expunge_inner(&self, state: &mut State, uids: Option<&[String]>) -> Result<()> {
        Self::require_messages(state)?;

        let doomed: Vec<String> = match state.summary.as_ref() {
            Some(summary) => summary
                .messages()
                .iter()
                .filter(|info| info.flags.contains(Flags::DELETED))
                .filter(|info| match uids {
                    Some(uids) => uids.contains(&info.uid),
                    None => true,
                })
                .map(|info| info.uid.clone())
                .collect(),
            None => return Ok(()),
        };

        if doomed.is_empty() {
            return Ok(());
        }

        let _lock = MboxLock::write(&state.path)?;

        let path = state.path.clone();
        let data = fs::read(&path)?;

        // rewrite the retained messages into a sibling temp file
        let (tmp_path, mut tmp) = Self::create_expunge_temp(&path)?;
        let result = Self::write_expunged(&mut tmp, &data, state, &doomed);

        let result = result
            .and_then(|()| tmp.flush().map_err(Error::from))
            .and_then(|()| tmp.sync_all().map_err(Error::from));
        drop(tmp);

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }

        // the file changed wholesale: reopen and rescan
        state.file = None;
        state.reopen_file()?;
        Self::scan_summary(state)?;

        Ok(())
    }

    fn create_expunge_temp(path: &Path) -> Result<(PathBuf, File)> {
        let pid = process::id();
        for attempt in 0..64 {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or_default();
            let tmp_path = PathBuf::from(format!(
                "{}.{pid}.{:06x}",
                path.display(),
                (nanos as u64 + attempt) & 0xffffff
            ));

            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&tmp_path)
            {
                Ok(file) => return Ok((tmp_path, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Err(Error::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "cannot create expunge temp file",
        )))
    }

    fn write_expunged(
        tmp: &mut File,
        data: &[u8],
        state: &State,
        doomed: &[String],
    ) -> Result<()> {
        let summary = state.summary.as_ref().ok_or(Error::NotConnected)?;
        let mut first = true;

        for info in summary.messages() {
            if doomed.contains(&info.uid) {
                continue;
            }

            let (start, body) = Self::read_region(data, summary, &info.uid)?;

            // original delimiter line, current flags
            let from_line = {
                let region = &data[start..];
                let len = region
                    .iter()
                    .position(|&b| b == b'\n')
                    .map(|i| i + 1)
                    .unwrap_or(region.len());
                &region[..len]
            };

            let body = envelope::strip_headers(&body, &["X-Spruce"]);
            let xspruce = format!(
                "X-Spruce: {}\n",
                mbox_summary::encode_xspruce(&info.uid, info.flags)
            );

            if !first {
                tmp.write_all(b"\n")?;
            }
            first = false;

            tmp.write_all(from_line)?;
            tmp.write_all(xspruce.as_bytes())?;
            tmp.write_all(&body)?;
            if !body.ends_with(b"\n") {
                tmp.write_all(b"\n")?;
            }
        }

        Ok(())
    }
}

struct MboxSearchSource {
    data: Vec<u8>,
    records: Vec<MessageInfo>,
    all_records: Vec<MessageInfo>,
}

impl SearchSource for MboxSearchSource {
    fn records(&self) -> &[MessageInfo] {
        &self.records
    }

    fn read_message(&self, uid: &str) -> Result<Vec<u8>> {
        let info = self
            .all_records
            .iter()
            .find(|info| info.uid == uid)
            .ok_or_else(|| Error::NoSuchMessage(uid.to_owned()))?;

        let start = info.frompos.max(0) as usize;
        let mut end = self.data.len();
        let mut is_last = true;
        for other in &self.all_records {
            if other.frompos > info.frompos && (other.frompos as usize) < end {
                end = other.frompos as usize;
                is_last = false;
            }
        }

        let body = mbox_summary::region_body(&self.data, start, end, is_last);
        Ok(mbox_summary::unescape_from(body))
    }
}

#[async_trait]
impl Folder for MboxFolder {
    fn name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    fn full_name(&self) -> String {
        self.state.lock().unwrap().full_name.clone()
    }

    fn kind(&self) -> FolderKind {
        self.state.lock().unwrap().kind
    }

    fn mode(&self) -> Option<FolderMode> {
        self.state.lock().unwrap().mode
    }

    fn exists(&self) -> bool {
        self.state.lock().unwrap().exists
    }

    fn counts(&self) -> SummaryCounts {
        let state = self.state.lock().unwrap();
        state
            .summary
            .as_ref()
            .map(|summary| summary.counts())
            .unwrap_or_default()
    }

    async fn open(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.open {
            return Ok(());
        }
        if !state.exists {
            return Err(Error::NoSuchFolder(state.full_name.clone()));
        }

        if state.kind.contains(FolderKind::CAN_HOLD_MESSAGES) {
            state.reopen_file()?;

            let summary = state.ensure_summary();
            if let Err(err) = summary.load() {
                debug!("summary is stale or missing, rescanning: {err}");
                Self::scan_summary(&mut state)?;
            }
        }

        state.open = true;
        Ok(())
    }

    async fn close(&self, expunge: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Ok(());
        }
        self.close_inner(&mut state, expunge)
    }

    async fn create(&self, kind: FolderKind) -> Result<()> {
        let store = self.store()?;
        let mut state = self.state.lock().unwrap();

        if let Some(parent) = state.path.parent() {
            fs::create_dir_all(parent)?;
        }

        if kind.contains(FolderKind::CAN_HOLD_MESSAGES) {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&state.path)?;
            state.kind |= FolderKind::CAN_HOLD_MESSAGES;
        }
        if kind.contains(FolderKind::CAN_HOLD_FOLDERS) {
            fs::create_dir_all(store.sbd_path(&state.full_name))?;
            state.kind |= FolderKind::CAN_HOLD_FOLDERS;
        }

        state.exists = true;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let store = self.store()?;
        let mut state = self.state.lock().unwrap();

        // subfolders first, then the mailbox and its summary
        if state.kind.contains(FolderKind::CAN_HOLD_FOLDERS) {
            match fs::remove_dir_all(store.sbd_path(&state.full_name)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        if state.kind.contains(FolderKind::CAN_HOLD_MESSAGES) {
            state.file = None;
            match fs::remove_file(&state.path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            match fs::remove_file(State::summary_path(&state.path)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        state.summary = None;
        state.kind = FolderKind::empty();
        state.exists = false;
        state.open = false;
        state.mode = None;

        Ok(())
    }

    async fn rename(&self, new_full_name: &str) -> Result<()> {
        let store = self.store()?;
        store.validate_name(new_full_name)?;

        let mut state = self.state.lock().unwrap();
        let old_full = state.full_name.clone();
        let new_path = store.build_path(new_full_name);

        if state.kind.contains(FolderKind::CAN_HOLD_MESSAGES) {
            state.file = None;
            fs::rename(&state.path, &new_path)?;
            match fs::rename(
                State::summary_path(&state.path),
                State::summary_path(&new_path),
            ) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        if state.kind.contains(FolderKind::CAN_HOLD_FOLDERS) {
            match fs::rename(store.sbd_path(&old_full), store.sbd_path(new_full_name)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        state.full_name = new_full_name.to_owned();
        state.name = match new_full_name.rsplit_once('/') {
            Some((_, name)) => name.to_owned(),
            None => new_full_name.to_owned(),
        };
        state.path = new_path.clone();
        if let Some(summary) = state.summary.as_mut() {
            summary.set_paths(State::summary_path(&new_path), new_path.clone());
        }

        store.registry().rekey_prefix(&old_full, new_full_name);
        state.signal.emit(&old_full, new_full_name);

        Ok(())
    }

    fn newname(&self, parent: &str, name: &str) {
        let store = match self.store.upgrade() {
            Some(store) => store,
            None => return,
        };

        let mut state = self.state.lock().unwrap();
        let old_full = state.full_name.clone();

        state.full_name = if parent.is_empty() {
            name.to_owned()
        } else {
            format!("{parent}/{name}")
        };
        state.name = name.to_owned();
        state.path = store.build_path(&state.full_name);
        let path = state.path.clone();
        if let Some(summary) = state.summary.as_mut() {
            summary.set_paths(State::summary_path(&path), path.clone());
        }

        let new_full = state.full_name.clone();
        state.signal.emit(&old_full, &new_full);
    }

    async fn expunge(&self, uids: Option<&[String]>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.expunge_inner(&mut state, uids)
    }

    async fn list(&self, pattern: &str) -> Result<Vec<Arc<dyn Folder>>> {
        let store = self.store()?;
        let full_name = self.full_name();
        let dir = store.sbd_path(&full_name);

        let mut names: Vec<String> = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().into_owned();
            if filename.starts_with('.') {
                continue;
            }

            // a `x.sbd/` directory and a `x` mailbox are one folder
            let name = match filename.strip_suffix(".sbd") {
                Some(name) => name.to_owned(),
                None => {
                    if RESERVED_SUFFIXES
                        .iter()
                        .any(|suffix| filename.ends_with(suffix))
                    {
                        continue;
                    }
                    filename
                }
            };

            if !crate::folder::glob_match(pattern, &name) {
                continue;
            }
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let mut folders: Vec<Arc<dyn Folder>> = Vec::with_capacity(names.len());
        for name in names {
            let child_full = if full_name.is_empty() {
                name
            } else {
                format!("{full_name}/{name}")
            };
            folders.push(store.get_folder(&child_full).await?);
        }

        Ok(folders)
    }

    async fn get_message(&self, uid: &str) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        Self::require_messages(&state)?;

        let _lock = MboxLock::read(&state.path)?;

        let data = fs::read(&state.path)?;
        let summary = state
            .summary
            .as_ref()
            .ok_or_else(|| Error::NoSuchMessage(uid.to_owned()))?;
        let (start, raw_body) = Self::read_region(&data, summary, uid)?;

        // refresh the cached header offset in case the mailbox was
        // edited by another program
        let from_len = data[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let flagspos = mbox_summary::find_xspruce(&raw_body)
            .map(|(offset, _)| (start + from_len) as i64 + offset)
            .unwrap_or(-1);

        if let Some(summary) = state.summary.as_mut() {
            if let Some(info) = summary.uid_mut(uid) {
                if info.flagspos != flagspos {
                    info.flagspos = flagspos;
                }
            }
        }

        Ok(mbox_summary::unescape_from(&raw_body))
    }

    async fn append_message(&self, message: &[u8], flags: Flags) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        Self::require_messages(&state)?;
        if state.mode == Some(FolderMode::ReadOnly) {
            return Err(io::Error::from_raw_os_error(libc::EROFS).into());
        }

        let _lock = MboxLock::write(&state.path)?;

        let from_line = create_from_line(message);
        let uid = format!("{:08x}", state.ensure_summary().next_uid());

        let mut info = MessageInfo::from_message(message);
        info.uid = uid.clone();
        info.flags = flags;

        let xspruce = format!("X-Spruce: {}\n", mbox_summary::encode_xspruce(&uid, flags));
        let body = mbox_summary::escape_from(&envelope::strip_headers(message, &["X-Spruce"]));

        let file = state.file()?;
        let offset = file.seek(SeekFrom::End(0))?;

        info.frompos = if offset == 0 { 0 } else { offset as i64 + 1 };
        info.flagspos = info.frompos + from_line.len() as i64 + "X-Spruce: ".len() as i64;

        let result = (|| -> io::Result<()> {
            if offset > 0 {
                file.write_all(b"\n")?;
            }
            file.write_all(from_line.as_bytes())?;
            file.write_all(xspruce.as_bytes())?;
            file.write_all(&body)?;
            if !body.ends_with(b"\n") {
                file.write_all(b"\n")?;
            }
            file.flush()
        })();

        if let Err(err) = result {
            // roll the mailbox back to its pre-append length
            warn!("append to mbox failed, truncating back: {err}");
            let _ = file.set_len(offset);
            return Err(err.into());
        }

        let summary = state.ensure_summary();
        summary.add(info);
        summary.touch();

        Ok(uid)
    }

    async fn search(&self, uids: Option<&[String]>, expression: &str) -> Result<Vec<String>> {
        let source = {
            let state = self.state.lock().unwrap();
            let all_records: Vec<MessageInfo> = state
                .summary
                .as_ref()
                .map(|summary| summary.messages().to_vec())
                .unwrap_or_default();
            let records = all_records
                .iter()
                .filter(|info| match uids {
                    Some(uids) => uids.contains(&info.uid),
                    None => true,
                })
                .cloned()
                .collect();
            let data = if state.kind.contains(FolderKind::CAN_HOLD_MESSAGES) {
                fs::read(&state.path)?
            } else {
                Vec::new()
            };
            MboxSearchSource {
                data,
                records,
                all_records,
            }
        };

        self.search.lock().unwrap().search(&source, expression)
    }

    async fn get_uids(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .summary
            .as_ref()
            .map(|summary| summary.uids())
            .unwrap_or_default())
    }

    async fn set_message_flags(&self, uid: &str, mask: Flags, set: Flags) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let summary = state
            .summary
            .as_mut()
            .ok_or_else(|| Error::NoSuchMessage(uid.to_owned()))?;
        let info = summary
            .uid_mut(uid)
            .ok_or_else(|| Error::NoSuchMessage(uid.to_owned()))?;

        let updated = (info.flags & !mask) | (set & mask);
        if updated != info.flags {
            info.flags = updated | Flags::DIRTY;
        }

        Ok(())
    }

    fn subscribe_renamed(&self, callback: RenamedCallback) -> usize {
        self.state.lock().unwrap().signal.subscribe(callback)
    }

    fn unsubscribe_renamed(&self, token: usize) {
        self.state.lock().unwrap().signal.unsubscribe(token);
    }
}

impl Drop for MboxFolder {
    fn drop(&mut self) {
        if let Some((parent, token)) = self.parent_sub.lock().unwrap().take() {
            if let Some(parent) = parent.upgrade() {
                parent.unsubscribe_renamed(token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::create_from_line;

    #[test]
    fn from_line_prefers_sender_then_from() {
        let msg = b"Sender: boss@example.com\nFrom: worker@example.com\nDate: Mon, 2 Jan 2006 15:04:05 +0000\n\nhi\n";
        let line = create_from_line(msg);
        assert!(line.starts_with("From boss@example.com "), "{line}");
        assert!(line.ends_with("2006\n"), "{line}");

        let msg = b"From: worker@example.com\nDate: Mon, 2 Jan 2006 15:04:05 +0000\n\nhi\n";
        assert!(create_from_line(msg).starts_with("From worker@example.com "));

        let msg = b"Subject: anonymous\n\nhi\n";
        assert!(create_from_line(msg).starts_with("From postmaster@localhost "));
    }

    #[test]
    fn from_line_prefers_received_date() {
        let msg = b"From: a@b\nReceived: from x by y; Tue, 3 Jan 2006 10:00:00 +0000\nDate: Mon, 2 Jan 2006 15:04:05 +0000\n\nhi\n";
        let line = create_from_line(msg);
        assert!(line.contains("Tue Jan  3 10:00:00 2006"), "{line}");
    }
}
