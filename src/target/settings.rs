//! Connection settings resolved from a target's configuration

use std::path::Path;
use std::time::Duration;

use tokio_rustls::TlsConnector;
use tracing::warn;

use super::tls::{build_connector, TlsMaterial};
use super::TargetError;
use crate::config::TargetConfig;
use crate::protocol::ProtocolVersion;
use crate::transport::Endpoint;

/// Everything the connection task needs to (re)connect
#[derive(Clone)]
pub struct ConnectionSettings {
    pub endpoint: Endpoint,
    pub protocol_version: ProtocolVersion,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: u16,
    pub clean_start: bool,
    pub connect_timeout: Duration,
    pub reconnect_period: Duration,
    /// Present for secure schemes only
    pub tls: Option<TlsConnector>,
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("endpoint", &self.endpoint)
            .field("protocol_version", &self.protocol_version)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("keep_alive", &self.keep_alive)
            .field("clean_start", &self.clean_start)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

/// `<name>_<8 hex chars>`
pub fn default_client_id(name: &str) -> String {
    format!("{}_{:08x}", name, rand::random::<u32>())
}

/// Read a CA file as UTF-8 PEM. A missing file is reported and skipped.
fn read_ca_file(path: &Path) -> Result<Option<String>, TargetError> {
    match std::fs::read_to_string(path) {
        Ok(pem) => Ok(Some(pem)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("CA file {} not found, ignoring", path.display());
            Ok(None)
        }
        Err(e) => Err(TargetError::CaFile(path.to_path_buf(), e)),
    }
}

impl ConnectionSettings {
    pub fn from_config(name: &str, config: &TargetConfig) -> Result<Self, TargetError> {
        let url = config
            .parsed_url()
            .map_err(|e| TargetError::InvalidConfig(format!("{}: {}", config.url, e)))?;
        let endpoint =
            Endpoint::from_url(&url).map_err(|e| TargetError::InvalidConfig(e.to_string()))?;

        let options = &config.options;
        let protocol_version = ProtocolVersion::try_from(options.protocol_version)
            .map_err(|e| TargetError::InvalidConfig(e.to_string()))?;

        // Userinfo in the URL fills credentials the options leave unset
        let username = options.username.clone().or_else(|| {
            Some(url.username())
                .filter(|u| !u.is_empty())
                .map(str::to_string)
        });
        let password = options
            .password
            .clone()
            .or_else(|| url.password().map(str::to_string));

        let tls = if endpoint.scheme.is_secure() {
            let ca = match (&options.ca, &config.ca_file) {
                (Some(ca), _) => Some(ca.clone()),
                (None, Some(path)) => read_ca_file(path)?,
                (None, None) => None,
            };
            let material = TlsMaterial {
                ca,
                cert: options.cert.clone(),
                key: options.key.clone(),
            };
            Some(build_connector(&material)?)
        } else {
            None
        };

        Ok(Self {
            endpoint,
            protocol_version,
            client_id: options
                .client_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| default_client_id(name)),
            username,
            password,
            keep_alive: options.keep_alive,
            clean_start: options.clean_start,
            connect_timeout: options.connect_timeout,
            reconnect_period: options.reconnect_period,
            tls,
        })
    }
}
