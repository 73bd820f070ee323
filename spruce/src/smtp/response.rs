//! SMTP reply decoding: response lines, multiline assembly, enhanced
//! status codes, xtext and the canonical descriptions for well-known
//! codes.

use crate::error::{Error, Result};

/// One decoded reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResponseLine {
    pub code: u16,
    /// Final lines use `<code> `; continuation lines use `<code>-`.
    pub is_final: bool,
    pub content: String,
}

/// Parse `<code>[ -]<text>`. A bare three-digit code is a final line
/// with empty text.
pub(crate) fn parse_line(line: &str) -> Result<ResponseLine> {
    let malformed = || Error::protocol(0, format!("malformed response line: {line}"));

    if line.len() < 3 || !line.is_char_boundary(3) {
        return Err(malformed());
    }

    let code: u16 = line[..3].parse().map_err(|_| malformed())?;

    let (is_final, content) = match line.as_bytes().get(3) {
        None => (true, ""),
        Some(b' ') => (true, &line[4..]),
        Some(b'-') => (false, &line[4..]),
        Some(_) => return Err(malformed()),
    };

    Ok(ResponseLine {
        code,
        is_final,
        content: content.to_owned(),
    })
}

/// A complete (possibly multiline) server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    /// The RFC 2034 enhanced status code, when negotiated and
    /// present.
    pub enhanced: Option<EnhancedStatus>,
    /// Decoded text, lines joined with `\n`.
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedStatus {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl Response {
    /// Assemble a reply from its lines. With `enhanced_codes`, the
    /// per-line `d.d.d` prefix is stripped (and remembered) and the
    /// remaining text is xtext-decoded.
    pub(crate) fn assemble(lines: &[ResponseLine], enhanced_codes: bool) -> Response {
        let code = lines.first().map(|line| line.code).unwrap_or_default();
        // enhanced codes only accompany 2xx/4xx/5xx replies; 3xx
        // continuations (AUTH challenges, DATA go-ahead) are verbatim
        let enhanced_codes = enhanced_codes && matches!(code / 100, 2 | 4 | 5);
        let mut enhanced = None;
        let mut text_lines = Vec::with_capacity(lines.len());

        for line in lines {
            let mut content = line.content.as_str();

            if enhanced_codes {
                if let Some((status, rest)) = split_enhanced(content) {
                    enhanced.get_or_insert(status);
                    content = rest;
                }
                text_lines.push(decode_xtext(content));
            } else {
                text_lines.push(content.to_owned());
            }
        }

        Response {
            code,
            enhanced,
            text: text_lines.join("\n"),
        }
    }

    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn is_permanent(&self) -> bool {
        (500..600).contains(&self.code)
    }

    /// Turn a rejection into the surfaced error: code, decoded text
    /// and the canonical description when the code is a known one.
    pub fn into_error(self) -> Error {
        let text = match (description(self.code), self.text.is_empty()) {
            (Some(desc), true) => desc.to_owned(),
            (Some(desc), false) => format!("{desc}: {}", self.text),
            (None, _) => self.text,
        };
        Error::protocol(self.code, text)
    }
}

/// Split a leading `class.subject.detail` enhanced status code off a
/// reply line.
fn split_enhanced(content: &str) -> Option<(EnhancedStatus, &str)> {
    let mut parts = content.splitn(2, ' ');
    let status = parts.next()?;
    let rest = parts.next().unwrap_or("");

    let mut fields = status.split('.');
    let class: u8 = fields.next()?.parse().ok()?;
    let subject: u16 = fields.next()?.parse().ok()?;
    let detail: u16 = fields.next()?.parse().ok()?;
    if fields.next().is_some() || !(1..=5).contains(&class) {
        return None;
    }

    Some((
        EnhancedStatus {
            class,
            subject,
            detail,
        },
        rest,
    ))
}

/// Decode xtext: `+HH` escapes an arbitrary octet; everything else is
/// literal.
pub(crate) fn decode_xtext(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'+' && i + 2 < bytes.len() {
            let hex = &text[i + 1..i + 3];
            if let Ok(b) = u8::from_str_radix(hex, 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Canonical descriptions for the reply codes of RFC 5321 (and the
/// AUTH extension).
pub fn description(code: u16) -> Option<&'static str> {
    Some(match code {
        211 => "System status, or system help reply",
        214 => "Help message",
        220 => "Service ready",
        221 => "Service closing transmission channel",
        250 => "Requested mail action okay, completed",
        251 => "User not local; will forward to <forward-path>",
        354 => "Start mail input; end with <CRLF>.<CRLF>",
        421 => "Service not available, closing transmission channel",
        432 => "A password transition is needed",
        450 => "Requested mail action not taken: mailbox unavailable",
        451 => "Requested action aborted: error in processing",
        452 => "Requested action not taken: insufficient system storage",
        454 => "Temporary authentication failure",
        500 => "Syntax error, command unrecognized",
        501 => "Syntax error in parameters or arguments",
        502 => "Command not implemented",
        504 => "Command parameter not implemented",
        530 => "Authentication required",
        534 => "Authentication mechanism is too weak",
        538 => "Encryption required for requested authentication mechanism",
        550 => "Requested action not taken: mailbox unavailable",
        551 => "User not local; please try <forward-path>",
        552 => "Requested mail action aborted: exceeded storage allocation",
        553 => "Requested action not taken: mailbox name not allowed",
        554 => "Transaction failed",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_final_and_continuation_lines() {
        let line = parse_line("250-8BITMIME").unwrap();
        assert_eq!(line.code, 250);
        assert!(!line.is_final);
        assert_eq!(line.content, "8BITMIME");

        let line = parse_line("250 ok").unwrap();
        assert!(line.is_final);

        let line = parse_line("354").unwrap();
        assert!(line.is_final);
        assert_eq!(line.content, "");

        assert!(parse_line("2x0 nope").is_err());
        assert!(parse_line("250_nope").is_err());
        assert!(parse_line("25").is_err());
    }

    #[test]
    fn assembles_enhanced_responses() {
        let lines = [
            parse_line("550-5.1.1 Mailbox+20\"nosuchuser\" does").unwrap(),
            parse_line("550 5.1.1 not exist").unwrap(),
        ];
        let response = Response::assemble(&lines, true);

        assert_eq!(response.code, 550);
        assert_eq!(
            response.enhanced,
            Some(EnhancedStatus {
                class: 5,
                subject: 1,
                detail: 1
            })
        );
        assert_eq!(response.text, "Mailbox \"nosuchuser\" does\nnot exist");
    }

    #[test]
    fn plain_responses_keep_text_verbatim() {
        let lines = [parse_line("250 2.0.0 looks+20fine").unwrap()];
        let response = Response::assemble(&lines, false);
        assert_eq!(response.enhanced, None);
        assert_eq!(response.text, "2.0.0 looks+20fine");
    }

    #[test]
    fn xtext_escapes() {
        assert_eq!(decode_xtext("a+20b"), "a b");
        assert_eq!(decode_xtext("no escapes"), "no escapes");
        assert_eq!(decode_xtext("trailing+2"), "trailing+2");
        assert_eq!(decode_xtext("+zz literal"), "+zz literal");
    }

    #[test]
    fn known_code_descriptions() {
        assert_eq!(description(220), Some("Service ready"));
        assert_eq!(description(554), Some("Transaction failed"));
        assert_eq!(description(299), None);
    }
}
