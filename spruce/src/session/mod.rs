//! # Session module
//!
//! The [`Session`] is the application's face to the library: it owns
//! credential interaction and the provider registry that turns
//! service URLs into stores and transports.

pub mod provider;

#[doc(inline)]
pub use self::provider::{Provider, ProviderRegistry, Service, ServiceKind};

bitflags::bitflags! {
    /// Modifiers for [`Session::request_passwd`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PasswdFlags: u32 {
        /// A cached secret was wrong: discard it and ask the user
        /// again.
        const REPROMPT = 1 << 0;
        /// The mechanism does not negotiate; there is nothing to
        /// re-prompt for.
        const STATIC   = 1 << 1;
    }
}

/// The callbacks a session must provide to the services it owns.
pub trait Session: Send + Sync {
    /// Show a one-line message to the user.
    fn alert_user(&self, text: &str);

    /// Ask for a secret. `key` identifies the credential (typically
    /// the service URL without its password) so implementations can
    /// cache. `None` means the user declined.
    fn request_passwd(&self, prompt: &str, key: &str, flags: PasswdFlags) -> Option<String>;

    /// Drop a cached secret.
    fn forget_passwd(&self, key: &str);
}
