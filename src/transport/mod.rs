//! Transport Layer
//!
//! Opens the byte stream an MQTT session runs over: plain TCP, TLS, or
//! WebSocket (optionally over TLS), behind one boxed interface.

mod websocket;

pub use websocket::WsStream;

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use url::{Host, Url};

/// Any duplex byte stream a session can run over
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Wire transport selected by the URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `mqtt://`, `tcp://`
    Tcp,
    /// `mqtts://`, `ssl://`, `tls://`
    Tls,
    /// `ws://`
    Ws,
    /// `wss://`
    Wss,
}

impl Scheme {
    pub fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            "mqtt" | "tcp" => Some(Scheme::Tcp),
            "mqtts" | "ssl" | "tls" => Some(Scheme::Tls),
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            _ => None,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Scheme::Tls | Scheme::Wss)
    }
}

/// Error type for target URLs that cannot be connected to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    UnsupportedScheme(String),
    MissingHost,
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::UnsupportedScheme(s) => write!(f, "unsupported URL scheme '{}'", s),
            EndpointError::MissingHost => write!(f, "URL has no host"),
        }
    }
}

impl std::error::Error for EndpointError {}

/// Resolved connection endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Request path for WebSocket transports
    pub path: String,
}

impl Endpoint {
    pub fn from_url(url: &Url) -> Result<Self, EndpointError> {
        let scheme = Scheme::parse(url.scheme())
            .ok_or_else(|| EndpointError::UnsupportedScheme(url.scheme().to_string()))?;

        let host = match url.host() {
            Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(EndpointError::MissingHost),
        };

        let mut path = match url.path() {
            "" | "/" => "/mqtt".to_string(),
            p => p.to_string(),
        };
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            scheme,
            port: url.port().unwrap_or_else(|| scheme.default_port()),
            host,
            path,
        })
    }

    /// URL used for the WebSocket handshake request
    fn websocket_url(&self) -> String {
        let scheme = if self.scheme == Scheme::Wss { "wss" } else { "ws" };
        if self.host.contains(':') {
            format!("{}://[{}]:{}{}", scheme, self.host, self.port, self.path)
        } else {
            format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Open a stream to the endpoint. `tls` must be provided for secure schemes.
pub async fn connect(endpoint: &Endpoint, tls: Option<&TlsConnector>) -> io::Result<BoxedStream> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    tcp.set_nodelay(true)?;

    match endpoint.scheme {
        Scheme::Tcp => Ok(Box::new(tcp)),
        Scheme::Ws => Ok(Box::new(
            WsStream::connect(tcp, &endpoint.websocket_url()).await?,
        )),
        Scheme::Tls | Scheme::Wss => {
            let connector = tls.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "TLS connector not configured")
            })?;
            let server_name = ServerName::try_from(endpoint.host.clone())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let stream = connector.connect(server_name, tcp).await?;

            if endpoint.scheme == Scheme::Wss {
                Ok(Box::new(
                    WsStream::connect(stream, &endpoint.websocket_url()).await?,
                ))
            } else {
                Ok(Box::new(stream))
            }
        }
    }
}
