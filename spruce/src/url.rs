//! # Service URLs
//!
//! Services are addressed by URL: `maildir:///path[#folder]`,
//! `mbox:///path#folder`, `smtp://user;AUTH=mech@host:port?starttls=yes`,
//! `smtps://…`. Parsing proper is delegated to the [`url`] crate; this
//! wrapper only exposes the fields the providers consume, including
//! the `;AUTH=mechanism` convention carried inside the userinfo.

use std::fmt;

use url::Url;

use crate::error::{Error, Result};

/// A parsed service URL.
#[derive(Clone, Debug)]
pub struct ServiceUrl {
    url: Url,
    user: Option<String>,
    auth: Option<String>,
}

impl ServiceUrl {
    pub fn parse(s: &str) -> Result<Self> {
        let url = Url::parse(s)
            .map_err(|err| Error::ServiceUnavailable(format!("cannot parse URL {s}: {err}")))?;

        let (user, auth) = match url.username() {
            "" => (None, None),
            userinfo => {
                // the URL parser percent-encodes `;` and `=` inside
                // the userinfo, so decode before splitting
                let userinfo = percent_decode(userinfo);
                let lower = userinfo.to_ascii_lowercase();
                match lower.find(";auth=") {
                    Some(i) => (
                        Some(userinfo[..i].to_owned()),
                        Some(userinfo[i + ";auth=".len()..].to_owned()),
                    ),
                    None => (Some(userinfo.to_owned()), None),
                }
            }
        };

        Ok(Self { url, user, auth })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port()
    }

    /// The user name, without the `;AUTH=` suffix.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// The requested SASL mechanism, from `user;AUTH=mech@host`.
    pub fn auth_mechanism(&self) -> Option<&str> {
        self.auth.as_deref()
    }

    /// The filesystem path for local stores.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// The folder addressed by the fragment; empty means the store's
    /// default folder.
    pub fn folder(&self) -> &str {
        self.url.fragment().unwrap_or_default()
    }

    pub fn param(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Whether the URL asks for a STARTTLS upgrade
    /// (`?starttls=yes|true`).
    pub fn starttls(&self) -> bool {
        matches!(self.param("starttls").as_deref(), Some("yes") | Some("true"))
    }

    /// Canonical service identity: scheme, user, host, port and path,
    /// without secrets, query or fragment. Two URLs with the same key
    /// address the same service instance.
    pub fn service_key(&self) -> String {
        let mut key = format!("{}://", self.scheme());
        if let Some(user) = &self.user {
            key.push_str(user);
            key.push('@');
        }
        if let Some(host) = self.host() {
            key.push_str(host);
        }
        if let Some(port) = self.port() {
            key.push_str(&format!(":{port}"));
        }
        key.push_str(self.path());
        key
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(b) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
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

/// Display renders the canonical key; passwords never round-trip
/// through this type.
impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.service_key())
    }
}

#[cfg(test)]
mod tests {
    use super::ServiceUrl;

    #[test]
    fn parses_local_store_urls() {
        let url = ServiceUrl::parse("maildir:///var/mail/alice#Sent/2024").unwrap();
        assert_eq!(url.scheme(), "maildir");
        assert_eq!(url.path(), "/var/mail/alice");
        assert_eq!(url.folder(), "Sent/2024");

        let url = ServiceUrl::parse("mbox:///home/alice/mail#archive").unwrap();
        assert_eq!(url.scheme(), "mbox");
        assert_eq!(url.folder(), "archive");
    }

    #[test]
    fn parses_smtp_auth_and_starttls() {
        let url = ServiceUrl::parse("smtp://alice;AUTH=PLAIN@mail.example.com:2525?starttls=yes")
            .unwrap();
        assert_eq!(url.scheme(), "smtp");
        assert_eq!(url.user(), Some("alice"));
        assert_eq!(url.auth_mechanism(), Some("PLAIN"));
        assert_eq!(url.host(), Some("mail.example.com"));
        assert_eq!(url.port(), Some(2525));
        assert!(url.starttls());
    }

    #[test]
    fn service_key_ignores_query_and_fragment() {
        let a = ServiceUrl::parse("smtp://alice@h:25?starttls=yes").unwrap();
        let b = ServiceUrl::parse("smtp://alice@h:25").unwrap();
        assert_eq!(a.service_key(), b.service_key());
    }
}
