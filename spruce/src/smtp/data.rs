//! Message preparation for the DATA phase: header stripping, the
//! 7bit/8bit constraint, CRLF normalization and dot-stuffing.

use tracing::warn;

use crate::envelope;

/// Headers that must never go out on the wire.
const STRIPPED_HEADERS: [&str; 3] = ["Bcc", "Resent-Bcc", "Content-Length"];

pub(crate) fn has_8bit(data: &[u8]) -> bool {
    data.iter().any(|&b| b >= 0x80)
}

/// Rewrite a message for transmission. Drops the stripped headers,
/// and when the server did not negotiate 8BITMIME re-encodes a simple
/// 8-bit text body as quoted-printable. Multipart messages with 8-bit
/// parts are passed through untouched; re-encoding a full MIME tree
/// is out of proportion here and most servers accept them anyway.
pub(crate) fn prepare(data: &[u8], allow_8bit: bool) -> Vec<u8> {
    let message = envelope::strip_headers(data, &STRIPPED_HEADERS);

    if allow_8bit || !has_8bit(&message) {
        return message;
    }

    let is_multipart = envelope::header_value(&message, "Content-Type")
        .map(|value| value.trim_start().to_ascii_lowercase().starts_with("multipart/"))
        .unwrap_or(false);
    if is_multipart {
        warn!("8-bit multipart message sent to a 7-bit server without re-encoding");
        return message;
    }

    let (headers, body) = split_message(&message);
    if !has_8bit(body) {
        // the 8-bit bytes are confined to the headers; nothing useful
        // to re-encode
        return message;
    }

    let mut out = envelope::strip_headers(headers, &["Content-Transfer-Encoding"]);
    out.extend_from_slice(b"Content-Transfer-Encoding: quoted-printable\n");
    out.extend_from_slice(b"\n");
    out.extend_from_slice(&qp_encode(body));
    out
}

/// Split raw message bytes at the header/body boundary. The returned
/// header block excludes the blank separator line.
fn split_message(data: &[u8]) -> (&[u8], &[u8]) {
    let mut offset = 0;
    for line in envelope::split_keep_newlines(data) {
        if envelope::trim_line_ending(line).is_empty() {
            return (&data[..offset], &data[offset + line.len()..]);
        }
        offset += line.len();
    }
    (data, &[])
}

/// Quoted-printable per RFC 2045: octets outside printable ASCII (and
/// literal `=`) become `=HH`, lines are soft-wrapped at 76 columns,
/// trailing whitespace is protected.
pub(crate) fn qp_encode(body: &[u8]) -> Vec<u8> {
    const LIMIT: usize = 76;

    let mut out = Vec::with_capacity(body.len() + body.len() / 8);

    for line in envelope::split_keep_newlines(body) {
        let content = envelope::trim_line_ending(line);
        let had_newline = line.len() != content.len();

        let mut column = 0;
        for (i, &b) in content.iter().enumerate() {
            let is_last = i + 1 == content.len();
            let literal = (b' '..=b'~').contains(&b) && b != b'=' && !(is_last && (b == b' ' || b == b'\t'));

            let width = if literal { 1 } else { 3 };
            if column + width > LIMIT - 1 {
                out.extend_from_slice(b"=\n");
                column = 0;
            }

            if literal {
                out.push(b);
            } else {
                out.extend_from_slice(format!("={b:02X}").as_bytes());
            }
            column += width;
        }

        if had_newline {
            out.push(b'\n');
        }
    }

    out
}

/// Normalize line endings to CRLF and dot-stuff lines starting with
/// `.`, per RFC 5321 §4.5.2.
pub(crate) fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 2);

    for line in envelope::split_keep_newlines(data) {
        let content = envelope::trim_line_ending(line);
        if content.starts_with(b".") {
            out.push(b'.');
        }
        out.extend_from_slice(content);
        out.extend_from_slice(b"\r\n");
    }

    out
}
