//! Maildir summary support: the filename flag codec and the shared
//! cur/new/tmp walk used to load and synchronize the summary.

use std::{fs, path::Path};

use tracing::{debug, warn};

use crate::{
    error::Result,
    flag::Flags,
    summary::{FolderSummary, MessageInfo},
};

pub(crate) const SUBDIRS: [&str; 3] = ["cur", "new", "tmp"];

/// Maildir info tags, shared by the `:1,` and `:2,` encodings.
const FLAG_TAGS: [(char, Flags); 6] = [
    ('R', Flags::ANSWERED),
    ('T', Flags::DELETED),
    ('D', Flags::DRAFT),
    ('F', Flags::FLAGGED),
    ('P', Flags::FORWARDED),
    ('S', Flags::SEEN),
];

/// Encode permanent flags as a `:2,` info tag sequence.
pub(crate) fn encode_flags(flags: Flags) -> String {
    let mut out = String::new();
    for (tag, flag) in FLAG_TAGS {
        if flags.contains(flag) {
            out.push(tag);
        }
    }
    out
}

/// The uid portion of a Maildir filename: everything before the first
/// `:`. Uid equality ignores the info suffix entirely.
pub(crate) fn uid_prefix(filename: &str) -> &str {
    match filename.split_once(':') {
        Some((uid, _)) => uid,
        None => filename,
    }
}

/// Decode `<uid>[:<ver>,<flags>]`. Returns `None` for info suffixes
/// in a format this library does not know.
pub(crate) fn decode_filename(filename: &str) -> Option<(String, Flags)> {
    let (uid, info) = match filename.split_once(':') {
        Some((uid, info)) => (uid, info),
        None => return Some((filename.to_owned(), Flags::empty())),
    };

    let tags = match info.split_once(',') {
        Some(("1", tags)) | Some(("2", tags)) => tags,
        _ => {
            warn!("unknown maildir info format: {info}");
            return None;
        }
    };

    let mut flags = Flags::empty();
    for tag in tags.chars() {
        if let Some((_, flag)) = FLAG_TAGS.iter().find(|(t, _)| *t == tag) {
            flags |= *flag;
        }
    }

    Some((uid.to_owned(), flags))
}

fn scan_file(
    summary: &mut FolderSummary,
    path: &Path,
    uid: String,
    flags: Flags,
    recent: bool,
) -> Result<()> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) => {
            // the file may have been expunged by another client
            warn!("cannot read maildir message {}: {err}", path.display());
            return Ok(());
        }
    };

    let mut info = MessageInfo::from_message(&raw);
    info.uid = uid;
    info.flags = flags;
    if recent {
        info.flags |= Flags::RECENT;
    }

    summary.add(info);
    Ok(())
}

/// Rebuild the summary by scanning `cur/` and `new/`. Files in `tmp/`
/// and dotfiles are ignored; presence in `new/` implies RECENT.
pub(crate) fn scan(maildir: &Path, summary: &mut FolderSummary) -> Result<()> {
    summary.clear();

    for subdir in ["cur", "new"] {
        let recent = subdir == "new";

        for entry in fs::read_dir(maildir.join(subdir))? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().into_owned();
            if filename.starts_with('.') {
                continue;
            }

            match decode_filename(&filename) {
                Some((uid, flags)) => {
                    scan_file(summary, &entry.path(), uid, flags, recent)?;
                }
                None => continue,
            }
        }
    }

    summary.set_scanned();
    Ok(())
}

/// Synchronize the summary with the filesystem before a save:
///
/// - record DIRTY and filename flags differ: rewrite the filename to
///   the record's flags and clear DIRTY;
/// - record clean and filename flags differ: adopt the on-disk flags;
/// - file unknown to the summary: scan it in, so deliveries made by
///   other clients are picked up.
///
/// `tmp/` is skipped entirely.
pub(crate) fn save_sync(maildir: &Path, summary: &mut FolderSummary) -> Result<()> {
    for subdir in ["cur", "new"] {
        let recent = subdir == "new";
        let dir = maildir.join(subdir);

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().into_owned();
            if filename.starts_with('.') {
                continue;
            }

            let (uid, disk_flags) = match decode_filename(&filename) {
                Some(decoded) => decoded,
                None => continue,
            };

            if summary.uid(&uid).is_none() {
                debug!("picking up externally delivered message {uid}");
                scan_file(summary, &entry.path(), uid, disk_flags, recent)?;
                continue;
            }

            let mut rename_to = None;
            if let Some(info) = summary.uid_mut(&uid) {
                if disk_flags != info.flags.permanent() {
                    if info.flags.contains(Flags::DIRTY) {
                        rename_to = Some(
                            dir.join(format!("{uid}:2,{}", encode_flags(info.flags.permanent()))),
                        );
                    } else {
                        info.flags = disk_flags | (info.flags & Flags::RECENT);
                    }
                }
            }

            if let Some(renamed) = rename_to {
                fs::rename(entry.path(), renamed)?;
            }

            if let Some(info) = summary.uid_mut(&uid) {
                info.flags.remove(Flags::DIRTY);
            }
        }
    }

    Ok(())
}
