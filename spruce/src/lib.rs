//! # spruce
//!
//! A library for managing local mailboxes and sending mail: uniform
//! access to Maildir and mbox stores, an SMTP/ESMTP transport with
//! authentication and STARTTLS, and a reusable search-expression
//! engine over message summaries.
//!
//! The entry points are:
//!
//! - [`ProviderRegistry`](session::ProviderRegistry): turn service
//!   URLs (`maildir:///…`, `mbox:///…`, `smtp://…`) into shared
//!   [`Store`](store::Store) and [`Transport`](transport::Transport)
//!   instances;
//! - [`Folder`](folder::Folder): the common folder contract
//!   (open/close, append, expunge, search, flag sync);
//! - [`SearchContext`](search::SearchContext) and
//!   [`FolderSearch`](search::folder::FolderSearch): the expression
//!   engine folders use to answer searches.

pub mod cache;
mod envelope;
pub mod error;
pub mod flag;
pub mod folder;
pub mod journal;
pub mod maildir;
pub mod mbox;
pub mod search;
pub mod session;
pub mod smtp;
pub mod store;
pub mod summary;
mod tls;
pub mod transport;
pub mod url;

#[doc(inline)]
pub use self::{
    error::{Error, Result},
    flag::Flags,
    folder::{Folder, FolderKind, FolderMode},
    session::{PasswdFlags, ProviderRegistry, Session},
    store::Store,
    summary::{FolderSummary, MessageInfo},
    transport::Transport,
    url::ServiceUrl,
};
