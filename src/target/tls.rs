//! TLS client configuration
//!
//! Builds the rustls connector for `mqtts://` and `wss://` targets from
//! inline PEM material: CA certificates (falling back to the bundled web
//! PKI roots) and an optional client certificate and key.

use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// Error type for TLS configuration
#[derive(Debug)]
pub enum TlsError {
    /// Certificate parsing error
    CertificateError(String),
    /// Private key error
    PrivateKeyError(String),
    /// TLS configuration error
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKeyError(msg) => write!(f, "Private key error: {}", msg),
            TlsError::ConfigError(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

/// PEM material for a TLS client
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

fn parse_certs(pem: &str, what: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse {}: {}", what, e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(format!(
            "No certificates found in {}",
            what
        )));
    }

    Ok(certs)
}

fn root_store(ca: Option<&str>) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    match ca {
        Some(pem) => {
            for cert in parse_certs(pem, "CA material")? {
                roots.add(cert).map_err(|e| {
                    TlsError::CertificateError(format!("Failed to add CA certificate: {}", e))
                })?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

/// Build a TlsConnector from the given material
pub fn build_connector(material: &TlsMaterial) -> Result<TlsConnector, TlsError> {
    let builder = ClientConfig::builder().with_root_certificates(root_store(material.ca.as_deref())?);

    let config = match (&material.cert, &material.key) {
        (Some(cert), Some(key)) => {
            let chain = parse_certs(cert, "client certificate")?;
            let key = PrivateKeyDer::from_pem_slice(key.as_bytes()).map_err(|e| {
                TlsError::PrivateKeyError(format!("Failed to parse private key: {}", e))
            })?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| TlsError::ConfigError(format!("Failed to build TLS config: {}", e)))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(TlsError::ConfigError(
                "client cert and key must be given together".to_string(),
            ))
        }
    };

    Ok(TlsConnector::from(Arc::new(config)))
}
