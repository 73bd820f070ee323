//! Mbox summary support: `From ` framing, the `X-Spruce` flag header
//! codec, `Status`/`X-Status` fallbacks, and the in-place flag sync
//! used before a summary save.

use std::{
    fs::File,
    io::{self, Seek, SeekFrom, Write},
    path::Path,
};

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tracing::debug;

use crate::{
    error::{Error, Result},
    flag::Flags,
    summary::{FolderSummary, MessageInfo},
};

/// `Status`/`X-Status` tags tolerated on load.
const STATUS_TAGS: [(char, Flags); 4] = [
    ('F', Flags::FLAGGED),
    ('A', Flags::ANSWERED),
    ('D', Flags::DELETED),
    ('R', Flags::SEEN),
];

static XSPRUCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m-u)^X-Spruce:[ \t]*([^\r\n]*)").expect("static regex")
});
static STATUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m-u)^(?:X-)?Status:[ \t]*([^\r\n]*)").expect("static regex")
});

pub(crate) fn decode_status(value: &str) -> Flags {
    let mut flags = Flags::empty();
    for tag in value.chars() {
        if let Some((_, flag)) = STATUS_TAGS.iter().find(|(t, _)| *t == tag) {
            flags |= *flag;
        }
    }
    flags
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.len() <= 8 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Encode a `X-Spruce` header value: `<uid8hex>-<flags4hex>`.
///
/// A uid already in the canonical 8-hex form is written verbatim so
/// the encoding is stable across load/save; a plain-decimal uid is
/// hex-encoded; anything else is written as-is.
pub(crate) fn encode_xspruce(uid: &str, flags: Flags) -> String {
    let flags = flags.permanent().bits() & 0xffff;

    if uid.len() == 8 && uid.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        format!("{uid}-{flags:04x}")
    } else if is_decimal(uid) {
        match uid.parse::<u32>() {
            Ok(n) => format!("{n:08x}-{flags:04x}"),
            Err(_) => format!("{uid}-{flags:04x}"),
        }
    } else {
        format!("{uid}-{flags:04x}")
    }
}

/// Decode a `X-Spruce` header value, canonicalizing hex uids to the
/// 8-lowercase-hex form.
pub(crate) fn decode_xspruce(value: &str) -> Option<(String, Flags)> {
    let (uid, flags) = value.split_once('-')?;
    let uid = uid.trim();
    let flags = u32::from_str_radix(flags.trim(), 16).ok()?;

    let uid = if is_hex(uid) {
        format!("{:08x}", u32::from_str_radix(uid, 16).ok()?)
    } else {
        uid.to_owned()
    };

    Some((uid, Flags::from_bits_truncate(flags & 0xffff)))
}

/// Byte ranges of the messages in an mbox image: each starts at a
/// `From ` line found at offset 0 or right after a blank line.
///
/// Fails when the file is non-empty but does not start with `From `.
pub(crate) fn message_regions(data: &[u8]) -> Result<Vec<(usize, usize)>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if !data.starts_with(b"From ") {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "mailbox does not start with a From line",
        )));
    }

    let mut starts = vec![0usize];
    let mut i = 0;
    while let Some(n) = data[i..].iter().position(|&b| b == b'\n') {
        let line_start = i + n + 1;
        if line_start >= data.len() {
            break;
        }
        if data[line_start..].starts_with(b"From ")
            && i + n >= 1
            && data[i + n - 1] == b'\n'
        {
            starts.push(line_start);
        }
        i = line_start;
    }

    let mut regions = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(data.len());
        regions.push((start, end));
    }

    Ok(regions)
}

/// The message bytes of a region: the `From ` line is dropped, and for
/// non-final regions the single separating newline is trimmed back
/// off.
pub(crate) fn region_body(data: &[u8], start: usize, end: usize, is_last: bool) -> &[u8] {
    let region = &data[start..end];
    let body_start = region
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(region.len());
    let mut body = &region[body_start..];

    if !is_last {
        if let Some(stripped) = body.strip_suffix(b"\n") {
            body = stripped;
        }
    }

    body
}

/// Quote body lines that would collide with the mbox delimiter:
/// `From ` at column 0 becomes `>From `.
pub(crate) fn escape_from(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for line in crate::envelope::split_keep_newlines(body) {
        if line.starts_with(b"From ") {
            out.push(b'>');
        }
        out.extend_from_slice(line);
    }
    out
}

/// Undo [`escape_from`].
pub(crate) fn unescape_from(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for line in crate::envelope::split_keep_newlines(body) {
        match line.strip_prefix(b">From ") {
            Some(rest) => {
                out.extend_from_slice(b"From ");
                out.extend_from_slice(rest);
            }
            None => out.extend_from_slice(line),
        }
    }
    out
}

fn header_block(region: &[u8]) -> &[u8] {
    match region.windows(2).position(|w| w == b"\n\n") {
        Some(i) => &region[..i + 1],
        None => region,
    }
}

/// Find the `X-Spruce` header in a message: returns the byte offset of
/// its value (relative to the message start) and the decoded value.
pub(crate) fn find_xspruce(message: &[u8]) -> Option<(i64, String)> {
    let captures = XSPRUCE.captures(header_block(message))?;
    let value = captures.get(1)?;
    Some((
        value.start() as i64,
        String::from_utf8_lossy(value.as_bytes()).into_owned(),
    ))
}

fn status_flags(message: &[u8]) -> Flags {
    let mut flags = Flags::empty();
    for captures in STATUS.captures_iter(header_block(message)) {
        if let Some(value) = captures.get(1) {
            flags |= decode_status(&String::from_utf8_lossy(value.as_bytes()));
        }
    }
    flags
}

/// Rebuild the summary by parsing the whole mailbox image.
///
/// On framing errors the summary is cleared and the error surfaced,
/// per the folder contract.
pub(crate) fn scan(path: &Path, data: &[u8], summary: &mut FolderSummary) -> Result<()> {
    summary.clear();

    let regions = match message_regions(data) {
        Ok(regions) => regions,
        Err(err) => {
            debug!("invalid mailbox {}: {err}", path.display());
            return Err(err);
        }
    };

    let count = regions.len();
    for (i, (start, end)) in regions.into_iter().enumerate() {
        let raw_body = region_body(data, start, end, i + 1 == count);
        let body = unescape_from(raw_body);

        let mut info = MessageInfo::from_message(&body);
        info.frompos = start as i64;

        // the X-Spruce offset is relative to the raw (escaped) bytes
        // actually in the file; the body begins after the From line
        let from_len = data[start..end]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(end - start);
        let body_offset = start + from_len;
        match find_xspruce(raw_body) {
            Some((value_offset, value)) => {
                info.flagspos = body_offset as i64 + value_offset;
                match decode_xspruce(&value) {
                    Some((uid, flags)) => {
                        info.uid = uid;
                        info.flags = flags;
                    }
                    None => {
                        info.uid = format!("{:08x}", summary.next_uid());
                        info.flags = status_flags(raw_body);
                    }
                }
            }
            None => {
                // delivered by another program: assign a uid and
                // treat it as new
                info.uid = format!("{:08x}", summary.next_uid());
                info.flags = status_flags(raw_body) | Flags::RECENT;
            }
        }

        summary.add(info);
    }

    summary.set_scanned();
    Ok(())
}

/// Sync DIRTY flags into the mailbox in place: the canonical X-Spruce
/// encoding is fixed-width (8 hex, dash, 4 hex), so a record whose
/// header offset is known can be patched without rewriting the file.
pub(crate) fn sync_flags(file: &mut File, summary: &mut FolderSummary) -> Result<()> {
    let uids = summary.uids();

    for uid in uids {
        let (flagspos, encoded) = match summary.uid(&uid) {
            Some(info) if info.flags.contains(Flags::DIRTY) && info.flagspos >= 0 => {
                (info.flagspos, encode_xspruce(&info.uid, info.flags))
            }
            _ => continue,
        };

        // only the fixed-width form can be patched in place
        if encoded.len() != 13 {
            continue;
        }

        file.seek(SeekFrom::Start(flagspos as u64))?;
        file.write_all(encoded.as_bytes())?;

        if let Some(info) = summary.uid_mut(&uid) {
            info.flags.remove(Flags::DIRTY);
        }
    }

    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xspruce_codec_round_trips() {
        let encoded = encode_xspruce("0000002a", Flags::SEEN | Flags::DELETED);
        assert_eq!(encoded, "0000002a-0012");

        let (uid, flags) = decode_xspruce(&encoded).unwrap();
        assert_eq!(uid, "0000002a");
        assert_eq!(flags, Flags::SEEN | Flags::DELETED);

        // plain decimal uids are hex-encoded
        assert_eq!(encode_xspruce("42", Flags::empty()), "0000002a-0000");
        // anything else goes through verbatim
        assert_eq!(
            encode_xspruce("some-opaque-uid", Flags::empty()),
            "some-opaque-uid-0000"
        );
    }

    #[test]
    fn status_tags() {
        assert_eq!(decode_status("RO"), Flags::SEEN);
        assert_eq!(decode_status("FA"), Flags::FLAGGED | Flags::ANSWERED);
    }

    #[test]
    fn regions_require_leading_from() {
        assert!(message_regions(b"X-Test: 1\n").is_err());
        assert!(message_regions(b"").unwrap().is_empty());

        let data = b"From a@b Thu Jan  1 00:00:00 1970\nSubject: one\n\nbody\n\nFrom c@d Thu Jan  1 00:00:00 1970\nSubject: two\n\nbody two\n";
        let regions = message_regions(data).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].0, 0);
        assert!(data[regions[1].0..].starts_with(b"From c@d"));
    }

    #[test]
    fn interior_from_is_not_a_delimiter() {
        let data = b"From a@b Thu Jan  1 00:00:00 1970\nSubject: one\n\n>From escaped\nFrom the middle of a paragraph\n";
        assert_eq!(message_regions(data).unwrap().len(), 1);
    }

    #[test]
    fn from_escaping() {
        let body = b"line\nFrom here\nnot From here\n";
        let escaped = escape_from(body);
        assert_eq!(escaped, b"line\n>From here\nnot From here\n");
        assert_eq!(unescape_from(&escaped), body);
    }

    #[test]
    fn xspruce_offset_is_relative_to_value() {
        let message = b"X-Spruce: 00000001-0010\nSubject: hi\n\nbody\n";
        let (offset, value) = find_xspruce(message).unwrap();
        assert_eq!(offset, "X-Spruce: ".len() as i64);
        assert_eq!(value, "00000001-0010");
    }

    #[test]
    fn scan_records_delimiter_offsets() {
        use crate::summary::FolderSummary;

        let m1 = b"From a@b Thu Jan  1 00:00:00 1970\nX-Spruce: 0000000a-0010\nSubject: one\n\nbody one\n";
        let m2 = b"From c@d Thu Jan  1 00:00:00 1970\nSubject: two\n\nbody two\n";
        let mut data = Vec::new();
        data.extend_from_slice(m1);
        data.push(b'\n');
        data.extend_from_slice(m2);

        let mut summary = FolderSummary::new("/nonexistent/.x.summary", "/nonexistent/x");
        scan(std::path::Path::new("/nonexistent/x"), &data, &mut summary).unwrap();

        assert_eq!(summary.count(), 2);

        let first = summary.index(0).unwrap();
        assert_eq!(first.frompos, 0);
        assert_eq!(first.uid, "0000000a");
        assert_eq!(first.flags, Flags::SEEN);
        // the recorded value offset points exactly at the encoded
        // flags in the file image
        let value_at = &data[first.flagspos as usize..first.flagspos as usize + 13];
        assert_eq!(value_at, b"0000000a-0010");

        let second = summary.index(1).unwrap();
        assert_eq!(second.frompos, (m1.len() + 1) as i64);
        assert_eq!(second.flagspos, -1);
        // no X-Spruce: freshly delivered, sequence uid, RECENT
        assert!(second.flags.contains(Flags::RECENT));
        assert_eq!(second.uid, "00000001");
        assert_eq!(second.subject, "two");
    }
}
