//! The Maildir folder: one directory with `cur/`, `new/` and `tmp/`
//! subdirectories, flags encoded in filenames, delivery through
//! `tmp/` with an atomic rename into `new/`.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    process,
    sync::{Arc, Mutex, Weak},
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
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
    store::MaildirStore,
    summary::{self as maildir_summary, encode_flags, uid_prefix, SUBDIRS},
};

const ACCESS_READ: u32 = 4;
const ACCESS_WRITE: u32 = 2;
const ACCESS_EXEC: u32 = 1;

/// Effective permissions on a maildir: the folder directory and each
/// of `cur/`, `new/` and `tmp/` are checked against the effective
/// uid/gid, and the modes are intersected.
fn access_mode(path: &Path) -> io::Result<u32> {
    let euid = unsafe { libc::geteuid() };
    let egid = unsafe { libc::getegid() };

    let mut mode = ACCESS_READ | ACCESS_WRITE | ACCESS_EXEC;

    let mut targets = vec![path.to_path_buf()];
    targets.extend(SUBDIRS.iter().map(|subdir| path.join(subdir)));

    for target in targets {
        let st = fs::metadata(&target)?;
        if !st.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
        }

        let bits = st.mode();
        let dirmode = if st.uid() == euid {
            (bits >> 6) & 7
        } else if st.gid() == egid {
            (bits >> 3) & 7
        } else {
            bits & 7
        };

        mode &= dirmode;
        if mode == 0 {
            break;
        }
    }

    Ok(mode)
}

/// Locate a message file by uid, searching `cur/` then `new/` (never
/// `tmp/`). Returns the path and whether it was found under `new/`.
fn locate(maildir: &Path, uid: &str) -> io::Result<Option<(PathBuf, bool)>> {
    for subdir in ["cur", "new"] {
        let dir = match fs::read_dir(maildir.join(subdir)) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };

        for entry in dir {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().into_owned();
            if filename.starts_with('.') {
                continue;
            }
            if uid_prefix(&filename) == uid {
                return Ok(Some((entry.path(), subdir == "new")));
            }
        }
    }

    Ok(None)
}

struct State {
    name: String,
    full_name: String,
    path: PathBuf,
    kind: FolderKind,
    exists: bool,
    open: bool,
    mode: Option<FolderMode>,
    summary: Option<FolderSummary>,
    signal: RenameSignal,
}

impl State {
    fn summary_path(path: &Path) -> PathBuf {
        path.join(".summary")
    }

    fn ensure_summary(&mut self) -> &mut FolderSummary {
        let path = self.path.clone();
        self.summary
            .get_or_insert_with(|| FolderSummary::new(Self::summary_path(&path), path.clone()))
    }
}

pub struct MaildirFolder {
    store: Weak<MaildirStore>,
    state: Mutex<State>,
    search: Mutex<FolderSearch>,
    /// Subscription on the parent folder's rename signal, dropped on
    /// finalization.
    parent_sub: Mutex<Option<(Weak<dyn Folder>, usize)>>,
}

impl MaildirFolder {
    pub(crate) fn new(store: Weak<MaildirStore>, full_name: &str) -> Result<Arc<Self>> {
        let path = match store.upgrade() {
            Some(store) => store.build_path(full_name),
            None => return Err(Error::ServiceUnavailable("maildir store was dropped".into())),
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
            summary: None,
            signal: RenameSignal::default(),
        };

        match fs::metadata(&path) {
            Ok(st) if st.is_dir() => {
                state.kind = FolderKind::CAN_HOLD_ANYTHING;
                state.exists = true;

                // load the cached header so counts are available
                // before open
                let summary = state.ensure_summary();
                if let Err(err) = summary.header_load() {
                    debug!("no usable summary header for {full_name}: {err}");
                }
            }
            Ok(_) => return Err(io::Error::from_raw_os_error(libc::ENOTDIR).into()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
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

    fn store(&self) -> Result<Arc<MaildirStore>> {
        self.store
            .upgrade()
            .ok_or_else(|| Error::ServiceUnavailable("maildir store was dropped".into()))
    }

    fn expunge_inner(&self, state: &mut State, uids: Option<&[String]>) -> Result<()> {
        let path = state.path.clone();
        let summary = match state.summary.as_mut() {
            Some(summary) => summary,
            None => return Ok(()),
        };

        let mut doomed: Vec<String> = summary
            .messages()
            .iter()
            .filter(|info| info.flags.contains(Flags::DELETED))
            .filter(|info| match uids {
                Some(uids) => uids.contains(&info.uid),
                None => true,
            })
            .map(|info| info.uid.clone())
            .collect();

        if doomed.is_empty() {
            return Ok(());
        }

        for subdir in ["cur", "new"] {
            if doomed.is_empty() {
                break;
            }

            for entry in fs::read_dir(path.join(subdir))? {
                let entry = entry?;
                let filename = entry.file_name().to_string_lossy().into_owned();
                let uid = uid_prefix(&filename).to_owned();

                if let Some(i) = doomed.iter().position(|doomed_uid| *doomed_uid == uid) {
                    match fs::remove_file(entry.path()) {
                        Ok(()) => {}
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                    summary.remove(&uid);
                    doomed.swap_remove(i);
                }
            }
        }

        // whatever is left was expunged by another client already
        for uid in doomed {
            summary.remove(&uid);
        }

        Ok(())
    }

    fn close_inner(&self, state: &mut State, expunge: bool) -> Result<()> {
        if expunge {
            self.expunge_inner(state, None)?;
        }

        let path = state.path.clone();
        if let Some(summary) = state.summary.as_mut() {
            maildir_summary::save_sync(&path, summary)?;
            summary.save()?;
        }

        state.open = false;
        state.mode = None;

        Ok(())
    }

    fn read_message_inner(path: &Path, uid: &str) -> Result<Vec<u8>> {
        let (mut location, in_new) = match locate(path, uid)? {
            Some(found) => found,
            None => return Err(Error::NoSuchMessage(uid.to_owned())),
        };

        if in_new {
            // seeing the message moves it from new/ to cur/
            let filename = location
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| uid.to_owned());
            let cur = path.join("cur").join(&filename);
            match fs::rename(&location, &cur) {
                Ok(()) => location = cur,
                Err(err) => {
                    // still readable from new/
                    warn!("cannot move {uid} from new/ to cur/: {err}");
                }
            }
        }

        Ok(fs::read(location)?)
    }
}

struct MaildirSearchSource {
    path: PathBuf,
    records: Vec<MessageInfo>,
}

impl SearchSource for MaildirSearchSource {
    fn records(&self) -> &[MessageInfo] {
        &self.records
    }

    fn read_message(&self, uid: &str) -> Result<Vec<u8>> {
        MaildirFolder::read_message_inner(&self.path, uid)
    }
}

#[async_trait]
impl Folder for MaildirFolder {
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

        let access = access_mode(&state.path)?;
        if access == 0 {
            return Err(io::Error::from_raw_os_error(libc::EACCES).into());
        }
        state.mode = Some(if access & ACCESS_WRITE != 0 {
            FolderMode::ReadWrite
        } else {
            FolderMode::ReadOnly
        });

        let path = state.path.clone();
        let summary = state.ensure_summary();
        if let Err(err) = summary.load() {
            debug!("summary is stale or missing, rescanning: {err}");
            maildir_summary::scan(&path, summary)?;
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

    async fn create(&self, _kind: FolderKind) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        fs::create_dir(&state.path)?;

        let mut created = 0;
        let mut failed = None;
        for subdir in SUBDIRS {
            match fs::create_dir(state.path.join(subdir)) {
                Ok(()) => created += 1,
                Err(err) => {
                    failed = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failed {
            // unwind whatever we managed to create
            for subdir in SUBDIRS.iter().take(created) {
                let _ = fs::remove_dir(state.path.join(subdir));
            }
            let _ = fs::remove_dir(&state.path);
            return Err(err.into());
        }

        state.kind = FolderKind::CAN_HOLD_ANYTHING;
        state.exists = true;

        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        // first any cruft: summary files and other non-subdir entries
        for entry in fs::read_dir(&state.path)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().into_owned();
            if SUBDIRS.contains(&filename.as_str()) {
                continue;
            }

            let result = if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())
            } else {
                fs::remove_file(entry.path())
            };
            if let Err(err) = result {
                return Err(err.into());
            }
        }

        let mut removed = 0;
        let mut failed = None;
        for subdir in SUBDIRS {
            match fs::remove_dir_all(state.path.join(subdir)) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => removed += 1,
                Err(err) => {
                    failed = Some(err);
                    break;
                }
            }
        }

        if failed.is_none() {
            if let Err(err) = fs::remove_dir(&state.path) {
                if err.kind() != io::ErrorKind::NotFound {
                    failed = Some(err);
                }
            }
        }

        if let Some(err) = failed {
            // keep the folder usable: best-effort recreation of the
            // subdirs we removed
            for subdir in SUBDIRS.iter().take(removed) {
                let _ = fs::create_dir(state.path.join(subdir));
            }
            return Err(err.into());
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

        fs::rename(&state.path, &new_path)?;

        // subfolder directories encode the parent name; move them
        // along so the retargeted children still point at real paths
        let old_prefix = format!(".{}.", old_full.replace('/', "."));
        let new_prefix = format!(".{}.", new_full_name.replace('/', "."));
        for entry in fs::read_dir(store.root())? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().into_owned();
            if let Some(rest) = filename.strip_prefix(&old_prefix) {
                let renamed = store.root().join(format!("{new_prefix}{rest}"));
                fs::rename(entry.path(), renamed)?;
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

        let prefix = if full_name.is_empty() {
            String::new()
        } else {
            format!("{}.", full_name.replace('/', "."))
        };

        let mut folders: Vec<Arc<dyn Folder>> = Vec::new();
        for entry in fs::read_dir(store.root())? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().into_owned();

            let dotted = match filename.strip_prefix('.') {
                Some(dotted) if !dotted.is_empty() && !dotted.starts_with('.') => dotted,
                _ => continue,
            };
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = match dotted.strip_prefix(&prefix) {
                Some(name) => name,
                None => continue,
            };

            // only direct children: deeper levels still contain dots
            if name.is_empty() || name.contains('.') {
                continue;
            }
            if !crate::folder::glob_match(pattern, name) {
                continue;
            }

            let child_full = if full_name.is_empty() {
                name.to_owned()
            } else {
                format!("{full_name}/{name}")
            };
            folders.push(store.get_folder(&child_full).await?);
        }

        Ok(folders)
    }

    async fn get_message(&self, uid: &str) -> Result<Vec<u8>> {
        let path = {
            let state = self.state.lock().unwrap();
            let summary = state
                .summary
                .as_ref()
                .ok_or_else(|| Error::NoSuchMessage(uid.to_owned()))?;
            if summary.uid(uid).is_none() {
                return Err(Error::NoSuchMessage(uid.to_owned()));
            }
            state.path.clone()
        };

        Self::read_message_inner(&path, uid)
    }

    async fn append_message(&self, message: &[u8], flags: Flags) -> Result<String> {
        let mut state = self.state.lock().unwrap();

        let hostname = gethostname::gethostname()
            .into_string()
            .unwrap_or_else(|_| "localhost.localdomain".to_owned());
        let pid = process::id();

        // uid uniqueness comes from the timestamp; retry (briefly)
        // when another delivery in the same second got there first
        let mut uid = String::new();
        let mut tmp_file = None;
        for retry in 0..5 {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            uid = format!("{secs}.{pid}.{hostname}");

            let taken = state
                .summary
                .as_ref()
                .map(|summary| summary.uid(&uid).is_some())
                .unwrap_or(false);
            if taken {
                if retry < 4 {
                    thread::sleep(Duration::from_secs(1));
                    continue;
                }
                break;
            }

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(state.path.join("tmp").join(&uid))
            {
                Ok(file) => {
                    tmp_file = Some(file);
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists && retry < 4 => {
                    thread::sleep(Duration::from_secs(1));
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut file = tmp_file.ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "cannot allocate a unique maildir uid",
            ))
        })?;
        let tmp_path = state.path.join("tmp").join(&uid);

        // flags live in the filename for Maildir
        let message = envelope::strip_headers(message, &["X-Spruce"]);

        let write_result = file
            .write_all(&message)
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_all());
        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        drop(file);

        let new_path = state
            .path
            .join("new")
            .join(format!("{uid}:2,{}", encode_flags(flags.permanent())));
        if let Err(err) = fs::rename(&tmp_path, &new_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }

        let mut info = MessageInfo::from_message(&message);
        info.uid = uid.clone();
        info.flags = flags;
        let summary = state.ensure_summary();
        summary.add(info);
        summary.touch();

        Ok(uid)
    }

    async fn search(&self, uids: Option<&[String]>, expression: &str) -> Result<Vec<String>> {
        let source = {
            let state = self.state.lock().unwrap();
            let records = state
                .summary
                .as_ref()
                .map(|summary| {
                    summary
                        .messages()
                        .iter()
                        .filter(|info| match uids {
                            Some(uids) => uids.contains(&info.uid),
                            None => true,
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            MaildirSearchSource {
                path: state.path.clone(),
                records,
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

impl Drop for MaildirFolder {
    fn drop(&mut self) {
        if let Some((parent, token)) = self.parent_sub.lock().unwrap().take() {
            if let Some(parent) = parent.upgrade() {
                parent.unsubscribe_renamed(token);
            }
        }
    }
}
