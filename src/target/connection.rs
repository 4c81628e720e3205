//! Connection task
//!
//! Owns the MQTT session for one target: connects, announces itself on the
//! status topic, forwards publications, keeps the connection alive and
//! reconnects with backoff after a drop. Commands that arrive while offline
//! are dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use super::settings::ConnectionSettings;
use super::{ConnectionStatus, SessionInfo, TargetError};
use crate::codec::{Decoder, Encoder};
use crate::lifecycle::ExitCode;
use crate::protocol::{
    Connect, Disconnect, Packet, Properties, ProtocolVersion, Publish, ReasonCode,
};
use crate::transport::{self, BoxedStream};

/// Backoff never grows past this multiple of the reconnect period
const MAX_BACKOFF_FACTOR: u32 = 30;

/// Request sent from the publisher to its connection task
#[derive(Debug)]
pub enum Command {
    Publish {
        topic: String,
        payload: Bytes,
    },
    /// Graceful disconnect; `done` fires once the DISCONNECT is flushed or
    /// immediately when offline
    Disconnect {
        code: ExitCode,
        cause: String,
        done: oneshot::Sender<()>,
    },
}

/// Run `fut` while draining commands that cannot be served offline.
/// Returns `None` when a disconnect was requested (or the publisher is gone).
async fn while_offline<F: Future>(
    fut: F,
    commands: &mut mpsc::Receiver<Command>,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            cmd = commands.recv() => match cmd {
                Some(Command::Publish { topic, .. }) => {
                    debug!("Not connected, dropping message for {}", topic);
                }
                Some(Command::Disconnect { done, .. }) => {
                    let _ = done.send(());
                    return None;
                }
                None => return None,
            },
        }
    }
}

pub(super) async fn connection_loop(
    settings: ConnectionSettings,
    status_topic: Option<String>,
    session_info: Arc<RwLock<SessionInfo>>,
    mut commands: mpsc::Receiver<Command>,
) {
    let base_retry = settings.reconnect_period;
    let max_retry = base_retry * MAX_BACKOFF_FACTOR;
    let mut retry_interval = base_retry;

    loop {
        session_info.write().status = ConnectionStatus::Connecting;
        debug!("Connecting to {}", settings.endpoint);

        let attempt = match while_offline(Session::connect(&settings), &mut commands).await {
            Some(attempt) => attempt,
            None => break,
        };

        let error = match attempt {
            Ok(mut session) => {
                retry_interval = base_retry;
                {
                    let mut info = session_info.write();
                    info.status = ConnectionStatus::Connected;
                    info.client_id = session.client_id.clone();
                }

                match session.run(&settings, status_topic.as_deref(), &mut commands).await {
                    Ok(()) => break,
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        warn!("Connection to {} failed: {}", settings.endpoint, error);
        session_info.write().status = ConnectionStatus::Backoff;

        if base_retry.is_zero() {
            info!("Reconnect disabled, staying offline");
            while_offline(std::future::pending::<()>(), &mut commands).await;
            break;
        }

        debug!("Reconnecting in {:?}", retry_interval);
        if while_offline(tokio::time::sleep(retry_interval), &mut commands)
            .await
            .is_none()
        {
            break;
        }
        retry_interval = std::cmp::min(retry_interval * 2, max_retry);
    }

    session_info.write().status = ConnectionStatus::Disconnected;
    debug!("Connection task finished");
}

/// An established MQTT session
struct Session {
    stream: BoxedStream,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    client_id: String,
}

impl Session {
    async fn connect(settings: &ConnectionSettings) -> Result<Self, TargetError> {
        if settings.connect_timeout.is_zero() {
            Self::handshake(settings).await
        } else {
            timeout(settings.connect_timeout, Self::handshake(settings))
                .await
                .map_err(|_| TargetError::Timeout)?
        }
    }

    /// Open the transport, send CONNECT and wait for CONNACK
    async fn handshake(settings: &ConnectionSettings) -> Result<Self, TargetError> {
        let stream = transport::connect(&settings.endpoint, settings.tls.as_ref()).await?;
        debug!("Transport connected to {}", settings.endpoint);

        let mut decoder = Decoder::new();
        decoder.set_protocol_version(settings.protocol_version);

        let mut session = Session {
            stream,
            encoder: Encoder::new(settings.protocol_version),
            decoder,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            client_id: settings.client_id.clone(),
        };

        let connect = Packet::Connect(Box::new(Connect {
            protocol_version: settings.protocol_version,
            client_id: settings.client_id.clone(),
            clean_start: settings.clean_start,
            keep_alive: settings.keep_alive,
            username: settings.username.clone(),
            password: settings.password.as_ref().map(|p| Bytes::from(p.clone())),
            properties: Properties::default(),
        }));
        session.send(&connect).await?;
        debug!("CONNECT sent");

        match session.read_packet().await? {
            Packet::ConnAck(connack) => {
                if !connack.reason_code.is_success() {
                    return Err(TargetError::Rejected(connack.reason_code));
                }
                if let Some(assigned) = connack.properties.assigned_client_identifier {
                    session.client_id = assigned;
                }
                debug!("Connected (session_present={})", connack.session_present);
            }
            other => {
                return Err(TargetError::Protocol(format!(
                    "expected CONNACK, got {}",
                    other.name()
                )))
            }
        }

        Ok(session)
    }

    /// Serve commands until a disconnect is requested
    async fn run(
        &mut self,
        settings: &ConnectionSettings,
        status_topic: Option<&str>,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Result<(), TargetError> {
        let status = format!("{} is connected", self.client_id);
        info!("{}", status);
        if let Some(topic) = status_topic {
            self.publish(topic.to_string(), Bytes::from(status)).await?;
        }

        let keep_alive_enabled = settings.keep_alive > 0;
        let keep_alive = Duration::from_secs(u64::from(settings.keep_alive.max(1)));
        let mut keepalive_timer = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Publish { topic, payload }) => {
                        self.publish(topic, payload).await?;
                    }
                    Some(Command::Disconnect { code, cause, done }) => {
                        self.disconnect(code, &cause).await;
                        let _ = done.send(());
                        return Ok(());
                    }
                    None => {
                        self.disconnect(ExitCode::SUCCESS, "Publisher dropped").await;
                        return Ok(());
                    }
                },

                packet = self.read_packet() => match packet? {
                    Packet::PingResp => {
                        trace!("PINGRESP received");
                        awaiting_pong = false;
                    }
                    Packet::Disconnect(disconnect) => {
                        let reason = disconnect
                            .properties
                            .reason_string
                            .unwrap_or_else(|| disconnect.reason_code.to_string());
                        return Err(TargetError::ConnectionLost(format!(
                            "server sent DISCONNECT: {}",
                            reason
                        )));
                    }
                    other => {
                        debug!("Ignoring {} (type {})", other.name(), other.packet_type());
                    }
                },

                _ = keepalive_timer.tick(), if keep_alive_enabled => {
                    if awaiting_pong {
                        return Err(TargetError::Timeout);
                    }
                    self.send(&Packet::PingReq).await?;
                    awaiting_pong = true;
                }
            }
        }
    }

    /// Publish at most once. A message the encoder rejects (e.g. a topic
    /// with wildcards) is dropped without affecting the session.
    async fn publish(&mut self, topic: String, payload: Bytes) -> Result<(), TargetError> {
        let packet = Packet::Publish(Publish::at_most_once(topic, payload));
        self.write_buf.clear();
        if let Err(e) = self.encoder.encode(&packet, &mut self.write_buf) {
            if let Packet::Publish(p) = &packet {
                warn!("Dropping message for '{}': {}", p.topic, e);
            }
            return Ok(());
        }
        self.flush().await
    }

    /// Send DISCONNECT carrying the exit code and cause, then close the stream
    async fn disconnect(&mut self, code: ExitCode, cause: &str) {
        let mut properties = Properties::default();
        if self.encoder.protocol_version() == ProtocolVersion::V5 {
            properties.reason_string = Some(cause.to_string());
            properties.user_properties = vec![("exit-code".to_string(), code.to_string())];
        }
        let packet = Packet::Disconnect(Disconnect {
            reason_code: if code.is_error() {
                ReasonCode::UnspecifiedError
            } else {
                ReasonCode::Success
            },
            properties,
        });

        if let Err(e) = self.send(&packet).await {
            debug!("DISCONNECT not delivered: {}", e);
        }
        if let Err(e) = self.stream.shutdown().await {
            debug!("Stream shutdown failed: {}", e);
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), TargetError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| TargetError::Protocol(format!("encode error: {}", e)))?;
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), TargetError> {
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read the next complete packet. Cancel safe: partial data stays
    /// buffered for the next call.
    async fn read_packet(&mut self) -> Result<Packet, TargetError> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(consumed);
                return Ok(packet);
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(TargetError::ConnectionLost(
                    "connection closed by server".to_string(),
                ));
            }
        }
    }
}
