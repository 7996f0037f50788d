use crate::utils::error::{LbPoolError, Result};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// TLS client settings for secure (`tcps`) backends.
#[derive(Clone)]
pub struct BackendTls {
    connector: TlsConnector,
    server_name: Option<ServerName<'static>>,
}

impl BackendTls {
    pub fn new(connector: TlsConnector) -> Self {
        Self {
            connector,
            server_name: None,
        }
    }

    /// Trust the certificates in a PEM bundle.
    pub fn from_ca_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let roots = load_roots(path.as_ref())?;
        Ok(Self::new(connector_for(roots)?))
    }

    /// Name to verify instead of the backend address.
    pub fn with_server_name(mut self, name: &str) -> Result<Self> {
        let name = ServerName::try_from(name.to_string())
            .map_err(|e| LbPoolError::Tls(format!("Invalid server name '{}': {}", name, e)))?;
        self.server_name = Some(name);
        Ok(self)
    }

    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub fn server_name_for(&self, address: &str) -> Result<ServerName<'static>> {
        if let Some(name) = &self.server_name {
            return Ok(name.clone());
        }
        ServerName::try_from(address.to_string()).map_err(|e| {
            LbPoolError::Tls(format!("Invalid backend address '{}': {}", address, e))
        })
    }
}

impl std::fmt::Debug for BackendTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendTls")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Client connector using the ring provider and the given trust roots.
pub fn connector_for(roots: RootCertStore) -> Result<TlsConnector> {
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let file = File::open(path).map_err(|e| {
        LbPoolError::Tls(format!("Failed to open CA file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| {
            LbPoolError::Tls(format!("Failed to parse CA file {}: {}", path.display(), e))
        })?;
        roots.add(cert)?;
    }

    if roots.is_empty() {
        return Err(LbPoolError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(roots)
}
