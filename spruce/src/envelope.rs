//! # Envelope helpers
//!
//! Helpers shared by the summary builders: display-form address
//! extraction from parsed messages, date conversion, and raw header
//! access for headers the MIME collaborator does not expose directly.

use chrono::{DateTime, FixedOffset, TimeZone};
use mail_parser::Address;

/// Format a parsed address header as a display string: mailboxes as
/// `Name <addr>` or bare `addr`, joined with `", "`. Groups are
/// flattened to their member mailboxes.
pub(crate) fn address_list_string(addr: Option<&Address>) -> String {
    let mut out = String::new();

    let mut push = |name: Option<&str>, email: Option<&str>| {
        let email = match email {
            Some(email) => email,
            None => return,
        };
        if !out.is_empty() {
            out.push_str(", ");
        }
        match name {
            Some(name) if !name.is_empty() => {
                out.push_str(name);
                out.push_str(" <");
                out.push_str(email);
                out.push('>');
            }
            _ => out.push_str(email),
        }
    };

    match addr {
        Some(Address::List(addrs)) => {
            for a in addrs {
                push(a.name.as_deref(), a.address.as_deref());
            }
        }
        Some(Address::Group(groups)) => {
            for group in groups {
                for a in &group.addresses {
                    push(a.name.as_deref(), a.address.as_deref());
                }
            }
        }
        None => {}
    }

    out
}

/// The first plain mailbox address of a parsed address header, if any.
pub(crate) fn first_mailbox(addr: Option<&Address>) -> Option<String> {
    match addr {
        Some(Address::List(addrs)) => addrs
            .iter()
            .find_map(|a| a.address.as_deref().map(str::to_owned)),
        Some(Address::Group(groups)) => groups
            .iter()
            .flat_map(|group| group.addresses.iter())
            .find_map(|a| a.address.as_deref().map(str::to_owned)),
        None => None,
    }
}

/// Convert a parsed message date to UTC epoch seconds. Returns 0 when
/// the components do not form a valid date.
pub(crate) fn datetime_to_epoch(dt: &mail_parser::DateTime) -> i64 {
    let tz_secs = (dt.tz_hour as i32) * 3600 + (dt.tz_minute as i32) * 60;
    let tz_sign = if dt.tz_before_gmt { -1 } else { 1 };

    FixedOffset::east_opt(tz_sign * tz_secs)
        .and_then(|tz| {
            tz.with_ymd_and_hms(
                dt.year as i32,
                dt.month as u32,
                dt.day as u32,
                dt.hour as u32,
                dt.minute as u32,
                dt.second as u32,
            )
            .earliest()
        })
        .map(|dt| dt.timestamp())
        .unwrap_or_default()
}

/// Find the unfolded value of the first header named `name` in the
/// header block of `raw`. Matching is case-insensitive; continuation
/// lines are joined with a single space.
pub(crate) fn header_value(raw: &[u8], name: &str) -> Option<String> {
    let mut value: Option<String> = None;

    for line in raw.split(|&b| b == b'\n') {
        let line = match line.strip_suffix(b"\r") {
            Some(line) => line,
            None => line,
        };

        // end of header block
        if line.is_empty() {
            break;
        }

        if line[0] == b' ' || line[0] == b'\t' {
            if let Some(value) = value.as_mut() {
                value.push(' ');
                value.push_str(String::from_utf8_lossy(line).trim());
            }
            continue;
        }

        if value.is_some() {
            // the matched header ended on the previous line
            break;
        }

        if let Some(colon) = line.iter().position(|&b| b == b':') {
            let (field, rest) = line.split_at(colon);
            if field.eq_ignore_ascii_case(name.as_bytes()) {
                value = Some(String::from_utf8_lossy(&rest[1..]).trim().to_owned());
            }
        }
    }

    value
}

/// Decode the delivery date from the first `Received` header: the last
/// `;`-separated segment holds an RFC 2822 date.
pub(crate) fn received_date(raw: &[u8]) -> Option<i64> {
    let received = header_value(raw, "Received")?;
    let date = received.rsplit(';').next()?;
    parse_rfc2822(date).map(|dt| dt.timestamp())
}

pub(crate) fn parse_rfc2822(date: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc2822(date.trim()).ok()
}

/// Collect the message-id tokens of the References header, falling
/// back to In-Reply-To when References is absent.
pub(crate) fn msg_references(raw: &[u8]) -> Vec<String> {
    let value = match header_value(raw, "References") {
        Some(value) => value,
        None => match header_value(raw, "In-Reply-To") {
            Some(value) => value,
            None => return Vec::new(),
        },
    };

    let mut refs = Vec::new();
    let mut rest = value.as_str();
    while let Some(start) = rest.find('<') {
        let Some(end) = rest[start..].find('>') else {
            break;
        };
        refs.push(rest[start..start + end + 1].to_owned());
        rest = &rest[start + end + 1..];
    }

    refs
}

/// Copy a message, dropping every header in `names` (with its
/// continuation lines) from the header block. The body is untouched.
pub(crate) fn strip_headers(raw: &[u8], names: &[&str]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut in_headers = true;
    let mut skipping = false;

    for line in split_keep_newlines(raw) {
        if in_headers {
            let trimmed = trim_line_ending(line);

            if trimmed.is_empty() {
                in_headers = false;
                skipping = false;
            } else if line[0] == b' ' || line[0] == b'\t' {
                // continuation belongs to the previous header
                if skipping {
                    continue;
                }
            } else {
                skipping = match trimmed.iter().position(|&b| b == b':') {
                    Some(colon) => names
                        .iter()
                        .any(|name| trimmed[..colon].eq_ignore_ascii_case(name.as_bytes())),
                    None => false,
                };
                if skipping {
                    continue;
                }
            }
        }

        out.extend_from_slice(line);
    }

    out
}

/// Iterate lines of `raw` including their line endings.
pub(crate) fn split_keep_newlines(raw: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = raw;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(rest.len());
        let (line, tail) = rest.split_at(end);
        rest = tail;
        Some(line)
    })
}

pub(crate) fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_headers_drops_continuations() {
        let raw = b"Bcc: hidden@example.com,\n\tother@example.com\nSubject: hi\n\nBcc: not a header\n";
        let out = strip_headers(raw, &["Bcc"]);
        assert_eq!(out, b"Subject: hi\n\nBcc: not a header\n");
    }

    #[test]
    fn header_value_unfolds() {
        let raw = b"Subject: hello\r\nReceived: from a\r\n\tby b; Mon, 2 Jan 2006 15:04:05 +0000\r\nX-Test: 1\r\n\r\nbody\r\nX-Test: body-side\r\n";
        assert_eq!(header_value(raw, "subject").as_deref(), Some("hello"));
        assert_eq!(
            header_value(raw, "Received").as_deref(),
            Some("from a by b; Mon, 2 Jan 2006 15:04:05 +0000")
        );
        // headers after the blank line belong to the body
        assert_eq!(header_value(raw, "X-Test").as_deref(), Some("1"));
    }

    #[test]
    fn received_date_uses_last_segment() {
        let raw = b"Received: from a (comment; with semicolon)\r\n\tby b; Mon, 2 Jan 2006 15:04:05 +0000\r\n\r\n";
        assert_eq!(received_date(raw), Some(1136214245));
    }
}
