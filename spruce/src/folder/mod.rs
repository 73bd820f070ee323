//! # Folder module
//!
//! The [`Folder`] trait is the common contract every store folder
//! implements: lifecycle (open/close/create/delete/rename), message
//! access (get/append/expunge), listing, searching and flag
//! synchronization.
//!
//! Folders form a hierarchy. A parent folder emits a "renamed"
//! notification when its own full name changes; subfolders subscribe
//! at construction time and react by recomputing their own path (see
//! [`RenameSignal`]).

use std::sync::Arc;

use async_trait::async_trait;

use crate::{error::Result, flag::Flags, summary::SummaryCounts};

bitflags::bitflags! {
    /// What a folder may contain.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FolderKind: u32 {
        const CAN_HOLD_MESSAGES = 1 << 0;
        const CAN_HOLD_FOLDERS  = 1 << 1;
        const CAN_HOLD_ANYTHING =
            Self::CAN_HOLD_MESSAGES.bits() | Self::CAN_HOLD_FOLDERS.bits();
    }
}

/// The access mode a folder was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderMode {
    ReadOnly,
    ReadWrite,
}

/// Callback invoked with (old_full_name, new_full_name) when a folder
/// is renamed.
pub type RenamedCallback = Box<dyn Fn(&str, &str) + Send + Sync>;

/// The list of "renamed" subscriptions of one folder.
///
/// Children subscribe in their constructor and unsubscribe on drop;
/// the emitting folder invokes every callback after its own state has
/// been retargeted.
#[derive(Default)]
pub struct RenameSignal {
    next_token: usize,
    subscribers: Vec<(usize, RenamedCallback)>,
}

impl RenameSignal {
    pub fn subscribe(&mut self, callback: RenamedCallback) -> usize {
        let token = self.next_token;
        self.next_token += 1;
        self.subscribers.push((token, callback));
        token
    }

    pub fn unsubscribe(&mut self, token: usize) {
        self.subscribers.retain(|(t, _)| *t != token);
    }

    pub fn emit(&self, old_name: &str, new_name: &str) {
        for (_, callback) in &self.subscribers {
            callback(old_name, new_name);
        }
    }
}

impl std::fmt::Debug for RenameSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenameSignal")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// A named, hierarchical container of messages within a store.
///
/// Implementations keep their mutable state behind an internal lock:
/// operations on a single folder execute in call order and are not
/// re-entrant from within a call.
#[async_trait]
pub trait Folder: Send + Sync {
    /// The display name of this folder (last path component).
    fn name(&self) -> String;

    /// The full, `/`-separated name of this folder within its store.
    fn full_name(&self) -> String;

    fn kind(&self) -> FolderKind;

    /// The mode the folder was opened with, if open.
    fn mode(&self) -> Option<FolderMode>;

    fn exists(&self) -> bool;

    /// Cached summary counts (total, unread, deleted).
    fn counts(&self) -> SummaryCounts;

    /// Open the folder: check access, then load the summary, scanning
    /// the backing store when the cached summary is stale.
    async fn open(&self) -> Result<()>;

    /// Close the folder, optionally expunging deleted messages first,
    /// and flush the summary.
    async fn close(&self, expunge: bool) -> Result<()>;

    /// Create the backing store entries for this folder.
    async fn create(&self, kind: FolderKind) -> Result<()>;

    /// Delete this folder from the backing store.
    async fn delete(&self) -> Result<()>;

    /// Rename this folder (and implicitly all of its subfolders).
    async fn rename(&self, new_full_name: &str) -> Result<()>;

    /// In-memory retarget after a parent rename: recompute this
    /// folder's names and paths under the renamed parent. Recursive
    /// through the rename signal.
    fn newname(&self, parent: &str, name: &str);

    /// Remove messages flagged DELETED, optionally restricted to a
    /// uid set.
    async fn expunge(&self, uids: Option<&[String]>) -> Result<()>;

    /// List direct subfolders matching a glob pattern.
    async fn list(&self, pattern: &str) -> Result<Vec<Arc<dyn Folder>>>;

    /// Fetch the raw bytes of one message.
    async fn get_message(&self, uid: &str) -> Result<Vec<u8>>;

    /// Append a message, returning its newly assigned uid.
    async fn append_message(&self, message: &[u8], flags: Flags) -> Result<String>;

    /// Run a search expression over this folder's summary, optionally
    /// restricted to a uid set. Returns matching uids.
    async fn search(&self, uids: Option<&[String]>, expression: &str) -> Result<Vec<String>>;

    async fn get_uids(&self) -> Result<Vec<String>>;

    /// Update the masked flag bits of one message. Sets DIRTY so the
    /// next summary sync writes the change through to the backing
    /// store.
    async fn set_message_flags(&self, uid: &str, mask: Flags, set: Flags) -> Result<()>;

    /// Register a "renamed" callback; returns a token for
    /// [`Folder::unsubscribe_renamed`].
    fn subscribe_renamed(&self, callback: RenamedCallback) -> usize;

    fn unsubscribe_renamed(&self, token: usize);
}

/// Split a full name into (parent, name). The parent of a top-level
/// name is the empty string.
pub(crate) fn split_full_name(full_name: &str) -> (&str, &str) {
    match full_name.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", full_name),
    }
}

/// Match a folder name against a simple glob pattern supporting `*`,
/// `?` and literal characters.
pub(crate) fn glob_match(pattern: &str, name: &str) -> bool {
    fn matches(p: &[char], n: &[char]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                matches(&p[1..], n) || (!n.is_empty() && matches(p, &n[1..]))
            }
            (Some('?'), Some(_)) => matches(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => matches(&p[1..], &n[1..]),
            _ => false,
        }
    }

    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    matches(&p, &n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_bits() {
        assert!(FolderKind::CAN_HOLD_ANYTHING.contains(FolderKind::CAN_HOLD_MESSAGES));
        assert!(FolderKind::CAN_HOLD_ANYTHING.contains(FolderKind::CAN_HOLD_FOLDERS));
    }

    #[test]
    fn split_names() {
        assert_eq!(split_full_name("a/b/c"), ("a/b", "c"));
        assert_eq!(split_full_name("a"), ("", "a"));
    }

    #[test]
    fn globs() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a?c", "abc"));
        assert!(glob_match("foo*bar", "foo-x-bar"));
        assert!(!glob_match("foo*bar", "foo-x-baz"));
    }

    #[test]
    fn rename_signal_tokens() {
        let mut signal = RenameSignal::default();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        let seen2 = seen.clone();
        let token = signal.subscribe(Box::new(move |old, new| {
            seen2.lock().unwrap().push(format!("{old}->{new}"));
        }));
        signal.emit("a", "b");
        signal.unsubscribe(token);
        signal.emit("b", "c");

        assert_eq!(seen.lock().unwrap().as_slice(), ["a->b".to_owned()]);
    }
}
