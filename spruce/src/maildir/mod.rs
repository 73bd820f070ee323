//! # Maildir store
//!
//! A store rooted at `<base>/`: each folder `a/b/c` is the directory
//! `<base>/.a.b.c/` holding `cur/`, `new/` and `tmp/`; the empty
//! folder name is `<base>/` itself, displayed as "Inbox".

mod folder;
pub(crate) mod store;
pub(crate) mod summary;

#[doc(inline)]
pub use self::{folder::MaildirFolder, store::MaildirStore};
