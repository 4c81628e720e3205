//! MQTT Targets
//!
//! A [`TargetPublisher`] owns one MQTT connection. Messages handed to it are
//! forwarded at most once; nothing is queued across a disconnect. Connect and
//! disconnect events are announced on the target's status topic.

mod connection;
mod settings;
mod tls;

pub use connection::Command;
pub use settings::{default_client_id, ConnectionSettings};
pub use tls::{build_connector, TlsError, TlsMaterial};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::config::TargetConfig;
use crate::lifecycle::{ExitCode, LifecycleState};
use crate::protocol::{DecodeError, ReasonCode};
use crate::source::Message;

/// Capacity of the command channel between publisher and connection task
const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Error type for target operations
#[derive(Debug)]
pub enum TargetError {
    /// Invalid target configuration
    InvalidConfig(String),
    /// CA file exists but cannot be read
    CaFile(PathBuf, std::io::Error),
    /// TLS material could not be loaded
    Tls(TlsError),
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Broker refused the connection
    Rejected(ReasonCode),
    /// Connect or keep-alive timed out
    Timeout,
    /// Unexpected or malformed packet
    Protocol(String),
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            TargetError::CaFile(path, e) => {
                write!(f, "Cannot read CA file {}: {}", path.display(), e)
            }
            TargetError::Tls(e) => write!(f, "TLS error: {}", e),
            TargetError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            TargetError::Rejected(code) => write!(f, "Rejected: {}", code),
            TargetError::Timeout => write!(f, "Operation timed out"),
            TargetError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for TargetError {}

impl From<TlsError> for TargetError {
    fn from(e: TlsError) -> Self {
        TargetError::Tls(e)
    }
}

impl From<std::io::Error> for TargetError {
    fn from(e: std::io::Error) -> Self {
        TargetError::ConnectionLost(e.to_string())
    }
}

impl From<DecodeError> for TargetError {
    fn from(e: DecodeError) -> Self {
        TargetError::Protocol(e.to_string())
    }
}

/// Status of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection failed, backing off before retry
    Backoff,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Backoff => write!(f, "backoff"),
        }
    }
}

/// State shared between a publisher and its connection task
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub status: ConnectionStatus,
    /// Configured id, replaced by the broker-assigned one after CONNACK
    pub client_id: String,
}

/// Downstream end of the bridge
///
/// Implemented by [`TargetPublisher`]; the orchestrator only relies on this
/// interface, so tests can substitute recording targets.
#[async_trait]
pub trait Target: Send {
    /// Identifier used in logs (the target URL)
    fn name(&self) -> &str;

    fn state(&self) -> LifecycleState;

    async fn start(&mut self) -> Result<(), TargetError>;

    /// Forward one message, best effort
    fn publish(&self, message: &Message);

    /// Announce the disconnect, then close the connection carrying `code`
    /// and `cause`. Returns once the disconnect completed. No-op unless
    /// running.
    async fn stop(&mut self, code: ExitCode, cause: &str);
}

/// Publishes messages to one MQTT broker
pub struct TargetPublisher {
    url: String,
    status_topic: Option<String>,
    settings: ConnectionSettings,
    state: LifecycleState,
    session: Arc<RwLock<SessionInfo>>,
    commands: Option<mpsc::Sender<Command>>,
    task: Option<JoinHandle<()>>,
    span: Span,
}

impl TargetPublisher {
    /// Build a publisher for `config`. `name` is the process name used for
    /// the default status topic and client id.
    pub fn new(name: &str, config: &TargetConfig) -> Result<Self, TargetError> {
        let settings = ConnectionSettings::from_config(name, config)?;
        let span = info_span!("target", url = %config.url);

        Ok(Self {
            url: config.url.clone(),
            status_topic: config.status_topic(name),
            session: Arc::new(RwLock::new(SessionInfo {
                status: ConnectionStatus::Disconnected,
                client_id: settings.client_id.clone(),
            })),
            settings,
            state: LifecycleState::Stopped,
            commands: None,
            task: None,
            span,
        })
    }

    pub fn status_topic(&self) -> Option<&str> {
        self.status_topic.as_deref()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.session.read().status
    }

    pub fn client_id(&self) -> String {
        self.session.read().client_id.clone()
    }

    /// Log `message` and publish it on the status topic if connected;
    /// otherwise it is dropped with a warning
    pub fn publish_status(&self, message: &str) {
        let _enter = self.span.enter();
        info!("{}", message);

        match (&self.status_topic, self.connection_status()) {
            (Some(topic), ConnectionStatus::Connected) => {
                self.send(Command::Publish {
                    topic: topic.clone(),
                    payload: Bytes::from(message.to_string()),
                });
            }
            (Some(_), _) => warn!("Currently disconnected, dropping status message"),
            (None, _) => {}
        }
    }

    fn send(&self, command: Command) {
        let Some(tx) = &self.commands else {
            return;
        };
        match tx.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Command queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Connection task gone, dropping message");
            }
        }
    }
}

#[async_trait]
impl Target for TargetPublisher {
    fn name(&self) -> &str {
        &self.url
    }

    fn state(&self) -> LifecycleState {
        self.state
    }

    async fn start(&mut self) -> Result<(), TargetError> {
        if self.state != LifecycleState::Stopped {
            let _enter = self.span.enter();
            warn!("Already {}, not starting", self.state);
            return Ok(());
        }
        self.state = LifecycleState::Starting;

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        self.commands = Some(tx);
        self.task = Some(tokio::spawn(
            connection::connection_loop(
                self.settings.clone(),
                self.status_topic.clone(),
                self.session.clone(),
                rx,
            )
            .instrument(self.span.clone()),
        ));

        self.state = LifecycleState::Running;
        Ok(())
    }

    fn publish(&self, message: &Message) {
        let _enter = self.span.enter();
        debug!("Publishing to '{}'", message.topic);
        self.send(Command::Publish {
            topic: message.topic.clone(),
            payload: message.payload(),
        });
    }

    async fn stop(&mut self, code: ExitCode, cause: &str) {
        if self.state != LifecycleState::Running {
            return;
        }
        self.state = LifecycleState::Stopping;

        self.publish_status(&format!(
            "{} is disconnected (Code: {}, Cause: {})",
            self.client_id(),
            code,
            cause
        ));

        if let Some(tx) = self.commands.take() {
            let (done_tx, done_rx) = oneshot::channel();
            let disconnect = Command::Disconnect {
                code,
                cause: cause.to_string(),
                done: done_tx,
            };
            // A closed channel means the task already ended
            if tx.send(disconnect).await.is_ok() {
                let _ = done_rx.await;
            }
        }

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                let _enter = self.span.enter();
                warn!("Connection task failed: {}", e);
            }
        }

        self.state = LifecycleState::Stopped;
        let _enter = self.span.enter();
        debug!("Stopped");
    }
}

impl Drop for TargetPublisher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
