//! # Error module
//!
//! All fallible operations in this library return [`Result`]. The
//! [`Error`] enum is the machine-readable side of every failure: each
//! variant is one of the error kinds surfaced to callers, the
//! formatted message is the human-readable one-liner.

use std::{io, result};

use thiserror::Error;

/// The global `Error` enum of the library.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote or local resource cannot be reached.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The operation requires an active connection.
    #[error("not connected to service")]
    NotConnected,

    /// Credential or mechanism failure.
    #[error("cannot authenticate: {0}")]
    CannotAuthenticate(String),

    /// The envelope sender address is unusable.
    #[error("invalid sender: {0}")]
    InvalidSender(String),

    /// An envelope recipient address is unusable.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// A message lookup failed in a local store.
    #[error("no such message: {0}")]
    NoSuchMessage(String),

    /// A folder lookup failed in a local store.
    #[error("no such folder: {0}")]
    NoSuchFolder(String),

    /// The folder name is not usable with this store.
    #[error("illegal folder name: {0}")]
    IllegalName(String),

    /// The underlying filesystem or network error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// An SMTP 4xx/5xx reply, with the decoded response text.
    #[error("{text} ({code})")]
    Protocol { code: u16, text: String },

    /// The operation was canceled before it completed.
    #[error("operation canceled")]
    Canceled,

    /// The operation did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// A search expression failed to build or evaluate.
    #[error("search error: {0}")]
    Search(String),
}

impl Error {
    /// Build a [`Error::Protocol`] from a reply code and decoded text.
    pub fn protocol(code: u16, text: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            text: text.into(),
        }
    }

    /// Whether this error means the peer went away and the connection
    /// must be re-established before retrying.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::NotConnected | Self::Timeout => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// The global `Result` alias of the library.
pub type Result<T> = result::Result<T, Error>;
