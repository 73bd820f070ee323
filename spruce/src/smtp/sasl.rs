//! SASL seam for the SMTP AUTH command.
//!
//! The real mechanism zoo is an external concern; this module fixes
//! the contract the transport drives and ships the two mechanisms
//! every server pair speaks, PLAIN and LOGIN.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::error::{Error, Result};

#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub user: String,
    pub secret: String,
}

/// One authentication exchange. Mechanisms are single-use: the
/// transport creates a fresh instance per attempt.
pub trait SaslMechanism: Send {
    fn name(&self) -> &'static str;

    /// Whether the mechanism negotiates a secret at all. A mechanism
    /// that does not gets exactly one attempt, with no reprompt.
    fn need_password(&self) -> bool {
        true
    }

    /// Whether the exchange has produced everything it needs.
    fn authenticated(&self) -> bool;

    /// The next base64-encoded client response. `challenge` is the
    /// decoded server challenge, or `None` for the initial round
    /// (a `Some` return there becomes the AUTH initial response).
    fn respond(&mut self, challenge: Option<&[u8]>, creds: &Credentials)
        -> Result<Option<String>>;
}

/// RFC 4616: a single `authzid NUL authcid NUL passwd` blob, sent in
/// answer to the server's (empty) challenge.
#[derive(Default)]
pub struct Plain {
    sent: bool,
}

impl SaslMechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn authenticated(&self) -> bool {
        self.sent
    }

    fn respond(
        &mut self,
        challenge: Option<&[u8]>,
        creds: &Credentials,
    ) -> Result<Option<String>> {
        match (self.sent, challenge) {
            // no initial response: wait for the server's go-ahead
            (false, None) => Ok(None),
            (false, Some(_)) => {
                self.sent = true;
                let payload = format!("\0{}\0{}", creds.user, creds.secret);
                Ok(Some(BASE64.encode(payload.as_bytes())))
            }
            (true, _) => Err(Error::CannotAuthenticate(
                "unexpected challenge after PLAIN response".into(),
            )),
        }
    }
}

/// The venerable LOGIN exchange: username and password in response to
/// two server challenges.
#[derive(Default)]
pub struct Login {
    stage: u8,
}

impl SaslMechanism for Login {
    fn name(&self) -> &'static str {
        "LOGIN"
    }

    fn authenticated(&self) -> bool {
        self.stage >= 2
    }

    fn respond(
        &mut self,
        challenge: Option<&[u8]>,
        creds: &Credentials,
    ) -> Result<Option<String>> {
        match (self.stage, challenge) {
            // no initial response: wait for the Username: prompt
            (0, None) => Ok(None),
            (0, Some(_)) => {
                self.stage = 1;
                Ok(Some(BASE64.encode(creds.user.as_bytes())))
            }
            (1, Some(_)) => {
                self.stage = 2;
                Ok(Some(BASE64.encode(creds.secret.as_bytes())))
            }
            _ => Err(Error::CannotAuthenticate(
                "unexpected challenge after LOGIN exchange".into(),
            )),
        }
    }
}

/// Instantiate a supported mechanism by its (case-insensitive) name.
pub fn for_name(name: &str) -> Option<Box<dyn SaslMechanism>> {
    match name.to_ascii_uppercase().as_str() {
        "PLAIN" => Some(Box::<Plain>::default()),
        "LOGIN" => Some(Box::<Login>::default()),
        _ => None,
    }
}

pub(crate) fn decode_challenge(challenge: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(challenge.trim())
        .map_err(|err| Error::CannotAuthenticate(format!("bad AUTH challenge: {err}")))
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    use super::{for_name, Credentials};

    fn creds() -> Credentials {
        Credentials {
            user: "alice".into(),
            secret: "s3cret".into(),
        }
    }

    #[test]
    fn plain_answers_the_empty_challenge() {
        let mut mech = for_name("plain").unwrap();
        assert_eq!(mech.respond(None, &creds()).unwrap(), None);

        let payload = mech.respond(Some(b""), &creds()).unwrap().unwrap();
        assert_eq!(BASE64.decode(payload).unwrap(), b"\0alice\0s3cret");
        assert!(mech.authenticated());
    }

    #[test]
    fn login_answers_two_challenges() {
        let mut mech = for_name("LOGIN").unwrap();
        assert_eq!(mech.respond(None, &creds()).unwrap(), None);

        let user = mech.respond(Some(b"Username:"), &creds()).unwrap().unwrap();
        assert_eq!(BASE64.decode(user).unwrap(), b"alice");
        assert!(!mech.authenticated());

        let pass = mech.respond(Some(b"Password:"), &creds()).unwrap().unwrap();
        assert_eq!(BASE64.decode(pass).unwrap(), b"s3cret");
        assert!(mech.authenticated());
    }

    #[test]
    fn unknown_mechanisms_are_refused() {
        assert!(for_name("GSSAPI").is_none());
    }
}
