//! # Providers
//!
//! A provider binds a URL scheme to the types that serve it: a store
//! constructor, a transport constructor, or both, plus the service
//! identity rule used to cache instances. The registry owns the
//! built-in providers (maildir, mbox, smtp/smtps) and the per-provider
//! weak service tables: a service stays shared while anyone holds it
//! and falls out of the table with its last reference.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use tracing::debug;

use crate::{
    error::{Error, Result},
    maildir::MaildirStore,
    mbox::MboxStore,
    smtp::SmtpService,
    store::Store,
    transport::Transport,
    url::ServiceUrl,
};

use super::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Store,
    Transport,
}

/// A resolved service instance.
pub enum Service {
    Store(Arc<dyn Store>),
    Transport(Arc<dyn Transport>),
}

pub type StoreCtor = fn(&ServiceUrl) -> Result<Arc<dyn Store>>;
pub type TransportCtor = fn(&ServiceUrl, Arc<dyn Session>) -> Result<Arc<dyn Transport>>;

/// One URL scheme and the services behind it.
pub struct Provider {
    pub scheme: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// SASL mechanisms this provider can drive, for UI listings.
    pub auth_mechanisms: &'static [&'static str],

    store: Option<StoreCtor>,
    transport: Option<TransportCtor>,

    store_cache: Mutex<HashMap<String, Weak<dyn Store>>>,
    transport_cache: Mutex<HashMap<String, Weak<dyn Transport>>>,
}

impl Provider {
    pub fn store_provider(
        scheme: &'static str,
        name: &'static str,
        description: &'static str,
        ctor: StoreCtor,
    ) -> Self {
        Self {
            scheme,
            name,
            description,
            auth_mechanisms: &[],
            store: Some(ctor),
            transport: None,
            store_cache: Mutex::new(HashMap::new()),
            transport_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport_provider(
        scheme: &'static str,
        name: &'static str,
        description: &'static str,
        auth_mechanisms: &'static [&'static str],
        ctor: TransportCtor,
    ) -> Self {
        Self {
            scheme,
            name,
            description,
            auth_mechanisms,
            store: None,
            transport: Some(ctor),
            store_cache: Mutex::new(HashMap::new()),
            transport_cache: Mutex::new(HashMap::new()),
        }
    }

    /// The equivalence rule for service instances of this provider.
    pub fn service_key(&self, url: &ServiceUrl) -> String {
        url.service_key()
    }

    fn get_store(&self, url: &ServiceUrl) -> Result<Arc<dyn Store>> {
        let ctor = self.store.ok_or_else(|| {
            Error::ServiceUnavailable(format!("{} provides no store", self.scheme))
        })?;

        let key = self.service_key(url);
        let mut cache = self.store_cache.lock().unwrap();

        if let Some(service) = cache.get(&key).and_then(Weak::upgrade) {
            return Ok(service);
        }
        cache.remove(&key);

        debug!("constructing {} store for {key}", self.scheme);
        let service = ctor(url)?;
        cache.insert(key, Arc::downgrade(&service));
        Ok(service)
    }

    fn get_transport(
        &self,
        url: &ServiceUrl,
        session: Arc<dyn Session>,
    ) -> Result<Arc<dyn Transport>> {
        let ctor = self.transport.ok_or_else(|| {
            Error::ServiceUnavailable(format!("{} provides no transport", self.scheme))
        })?;

        let key = self.service_key(url);
        let mut cache = self.transport_cache.lock().unwrap();

        if let Some(service) = cache.get(&key).and_then(Weak::upgrade) {
            return Ok(service);
        }
        cache.remove(&key);

        debug!("constructing {} transport for {key}", self.scheme);
        let service = ctor(url, session)?;
        cache.insert(key, Arc::downgrade(&service));
        Ok(service)
    }
}

fn maildir_store(url: &ServiceUrl) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = MaildirStore::new(url)?;
    Ok(store)
}

fn mbox_store(url: &ServiceUrl) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = MboxStore::new(url)?;
    Ok(store)
}

fn smtp_transport(url: &ServiceUrl, session: Arc<dyn Session>) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = SmtpService::new(url.clone(), session);
    Ok(transport)
}

/// The scheme-to-provider registry. One per application; built-in
/// providers register at construction.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<Provider>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ProviderRegistry {
    /// An empty registry, for callers that supply every provider.
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();

        registry.register(Provider::store_provider(
            "maildir",
            "Maildir",
            "Mail delivered into a qmail-style Maildir directory tree",
            maildir_store,
        ));
        registry.register(Provider::store_provider(
            "mbox",
            "Mbox",
            "Mail stored in Berkeley mbox format files",
            mbox_store,
        ));
        registry.register(Provider::transport_provider(
            "smtp",
            "SMTP",
            "Mail delivery through a SMTP smart host",
            &["PLAIN", "LOGIN"],
            smtp_transport,
        ));
        registry.register(Provider::transport_provider(
            "smtps",
            "SMTP over TLS",
            "Mail delivery through a SMTP smart host over TLS",
            &["PLAIN", "LOGIN"],
            smtp_transport,
        ));

        registry
    }

    pub fn register(&mut self, provider: Provider) {
        self.providers
            .insert(provider.scheme.to_owned(), Arc::new(provider));
    }

    pub fn provider(&self, scheme: &str) -> Option<&Arc<Provider>> {
        self.providers.get(scheme)
    }

    /// Parse a service URI and return the matching (possibly cached)
    /// store.
    pub fn get_store(&self, uri: &str) -> Result<Arc<dyn Store>> {
        let url = ServiceUrl::parse(uri)?;
        let provider = self.provider(url.scheme()).ok_or_else(|| {
            Error::ServiceUnavailable(format!("no provider for scheme {}", url.scheme()))
        })?;
        provider.get_store(&url)
    }

    /// Parse a service URI and return the matching (possibly cached)
    /// transport.
    pub fn get_transport(&self, uri: &str, session: Arc<dyn Session>) -> Result<Arc<dyn Transport>> {
        let url = ServiceUrl::parse(uri)?;
        let provider = self.provider(url.scheme()).ok_or_else(|| {
            Error::ServiceUnavailable(format!("no provider for scheme {}", url.scheme()))
        })?;
        provider.get_transport(&url, session)
    }

    /// Kind-dispatching variant of [`ProviderRegistry::get_store`] /
    /// [`ProviderRegistry::get_transport`].
    pub fn get_service(
        &self,
        uri: &str,
        kind: ServiceKind,
        session: Arc<dyn Session>,
    ) -> Result<Service> {
        match kind {
            ServiceKind::Store => Ok(Service::Store(self.get_store(uri)?)),
            ServiceKind::Transport => {
                Ok(Service::Transport(self.get_transport(uri, session)?))
            }
        }
    }
}
