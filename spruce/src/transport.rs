//! # Transport module
//!
//! A [`Transport`] delivers outbound messages for one URL-identified
//! service. The only implementation in-tree is the SMTP transport
//! (see [`crate::smtp`]); the trait is what the provider registry and
//! session glue hand out.

use async_trait::async_trait;

use crate::error::Result;

/// An outbound message service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish (or re-establish) the connection, including any
    /// negotiated security and authentication.
    async fn connect(&self) -> Result<()>;

    /// Close the connection; `clean` says goodbye to the peer first.
    async fn disconnect(&self, clean: bool) -> Result<()>;

    /// Send one message to the given envelope recipients.
    async fn send(&self, from: &str, recipients: &[String], message: &[u8]) -> Result<()>;
}
