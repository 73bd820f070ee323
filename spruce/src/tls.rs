//! TLS helpers for the transports: one process-wide rustls connector
//! over the platform trust store, with the Mozilla roots as fallback.

use std::sync::{Arc, OnceLock};

use tokio::net::TcpStream;
use tokio_rustls::{
    client::TlsStream,
    rustls::{pki_types::ServerName, ClientConfig, RootCertStore},
    TlsConnector,
};

use crate::error::{Error, Result};

fn build_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();

    if let Ok(certs) = rustls_native_certs::load_native_certs() {
        for cert in certs {
            let _ = roots.add(cert);
        }
    }

    if roots.is_empty() {
        roots.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }

    roots
}

fn connector() -> &'static TlsConnector {
    static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();
    CONNECTOR.get_or_init(|| {
        let config = ClientConfig::builder()
            .with_root_certificates(build_root_store())
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    })
}

/// Run a TLS handshake over an established TCP stream, for both
/// implicit TLS (`smtps`) and STARTTLS upgrades.
pub(crate) async fn handshake(host: &str, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| Error::ServiceUnavailable(format!("invalid TLS server name {host}")))?;

    Ok(connector().connect(server_name, tcp).await?)
}
