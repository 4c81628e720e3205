//! FIFO Sources
//!
//! A [`SourceProvider`] owns one named pipe. Every line written into the pipe
//! is framed into a [`Message`] and sent to the orchestrator. What happens
//! when the last writer closes the pipe is decided by the source's
//! [`OnClose`] policy.

mod fifo;

pub use fifo::{ensure_fifo, is_fifo, unblock_reader, FifoStatus};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::{OnClose, SourceConfig};
use crate::lifecycle::LifecycleState;

/// Delay before reopening after a failed open
const REOPEN_DELAY: Duration = Duration::from_secs(1);

/// Interval and attempts for waking a reader stuck in `open`
const UNBLOCK_INTERVAL: Duration = Duration::from_millis(10);
const UNBLOCK_ATTEMPTS: usize = 100;

/// One framed line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub content: Option<String>,
}

impl Message {
    pub fn new(topic: impl Into<String>, content: Option<String>) -> Self {
        Self {
            topic: topic.into(),
            content,
        }
    }

    /// Split `line` on the first occurrence of `separator`.
    ///
    /// A separator at the very start of the line does not count, so the whole
    /// line becomes the topic and there is no content.
    pub fn frame(line: &str, separator: &str) -> Self {
        match line.find(separator) {
            Some(index) if index > 0 && !separator.is_empty() => Self {
                topic: line[..index].to_string(),
                content: Some(line[index + separator.len()..].to_string()),
            },
            _ => Self {
                topic: line.to_string(),
                content: None,
            },
        }
    }

    /// Publication payload; empty when there is no content
    pub fn payload(&self) -> Bytes {
        match &self.content {
            Some(content) => Bytes::from(content.clone()),
            None => Bytes::new(),
        }
    }
}

/// Events a source sends to the orchestrator
#[derive(Debug)]
pub enum SourceEvent {
    /// A line was read from source `source`
    Message { source: usize, message: Message },
    /// Source `source` closed with the `shutdown` policy
    Closed { source: usize },
}

/// Error type for source operations
#[derive(Debug)]
pub enum SourceError {
    /// The FIFO could not be created
    Create(PathBuf, std::io::Error),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Create(path, e) => {
                write!(f, "Cannot create FIFO {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for SourceError {}

/// Upstream end of the bridge
///
/// Implemented by [`SourceProvider`]; the orchestrator only relies on this
/// interface.
#[async_trait]
pub trait Source: Send {
    /// Identifier used in logs (the FIFO path)
    fn name(&self) -> &str;

    fn state(&self) -> LifecycleState;

    /// Begin reading. A FIFO that cannot be created is reported through the
    /// close policy, not as an error here.
    async fn start(&mut self) -> Result<(), SourceError>;

    /// Stop reading and release the FIFO. No-op unless active.
    async fn stop(&mut self);
}

/// Reads framed messages from one FIFO
pub struct SourceProvider {
    id: usize,
    name: String,
    path: PathBuf,
    mode: u32,
    separator: String,
    on_close: OnClose,
    state: Arc<RwLock<LifecycleState>>,
    events: mpsc::Sender<SourceEvent>,
    shutdown: Option<watch::Sender<bool>>,
    reopens: Arc<AtomicU64>,
    /// Set while a blocking open of the FIFO is outstanding
    opening: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    span: Span,
}

impl SourceProvider {
    /// Build a provider for `config`; messages are split on `separator` and
    /// tagged with `id` when sent on `events`
    pub fn new(
        id: usize,
        config: &SourceConfig,
        separator: String,
        events: mpsc::Sender<SourceEvent>,
    ) -> Self {
        let name = config.path.display().to_string();
        let span = info_span!("source", path = %name);

        Self {
            id,
            name,
            path: config.path.clone(),
            mode: config.mode,
            separator,
            on_close: config.on_close,
            state: Arc::new(RwLock::new(LifecycleState::Stopped)),
            events,
            shutdown: None,
            reopens: Arc::new(AtomicU64::new(0)),
            opening: Arc::new(AtomicBool::new(false)),
            task: None,
            span,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn on_close(&self) -> OnClose {
        self.on_close
    }

    /// Number of times the FIFO was reopened after a close
    pub fn reopen_count(&self) -> u64 {
        self.reopens.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.write() = state;
    }

    fn unblock(&self) {
        if let Err(e) = unblock_reader(&self.path) {
            debug!("Cannot unblock reader: {}", e);
        }
    }
}

/// Create the FIFO if needed; anything else at the path is only reported
fn prepare_fifo(path: &Path, mode: u32) -> Result<(), SourceError> {
    match ensure_fifo(path, mode) {
        Ok(FifoStatus::Created) => {
            debug!("Created FIFO with mode {:o}", mode);
            Ok(())
        }
        Ok(FifoStatus::Existing) => Ok(()),
        Ok(FifoStatus::NotFifo) => {
            warn!("Path exists but is not a FIFO, reading it anyway");
            Ok(())
        }
        Err(e) => Err(SourceError::Create(path.to_path_buf(), e)),
    }
}

#[async_trait]
impl Source for SourceProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    async fn start(&mut self) -> Result<(), SourceError> {
        let _enter = self.span.enter();
        let state = self.state();
        if state != LifecycleState::Stopped {
            warn!("Already {}, not starting", state);
            return Ok(());
        }
        self.set_state(LifecycleState::Starting);

        // A FIFO that cannot be created counts as a failed open and goes
        // through the close policy like any other
        let prepared = match prepare_fifo(&self.path, self.mode) {
            Ok(()) => true,
            Err(e) => {
                error!("{}", e);
                false
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);

        let reader = Reader {
            id: self.id,
            path: self.path.clone(),
            mode: self.mode,
            separator: self.separator.clone(),
            on_close: self.on_close,
            state: self.state.clone(),
            events: self.events.clone(),
            shutdown: shutdown_rx,
            reopens: self.reopens.clone(),
            opening: self.opening.clone(),
            prepared,
        };
        self.task = Some(tokio::spawn(reader.run().instrument(self.span.clone())));

        self.set_state(LifecycleState::Running);
        info!("Source is open");
        Ok(())
    }

    async fn stop(&mut self) {
        if !self.state().is_active() {
            return;
        }
        self.set_state(LifecycleState::Stopping);

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.unblock();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                let _enter = self.span.enter();
                warn!("Reader task failed: {}", e);
            }
        }
        // The blocking open outlives the reader task
        let mut attempts = 0;
        while self.opening.load(Ordering::SeqCst) && attempts < UNBLOCK_ATTEMPTS {
            self.unblock();
            tokio::time::sleep(UNBLOCK_INTERVAL).await;
            attempts += 1;
        }
        if self.opening.load(Ordering::SeqCst) {
            let _enter = self.span.enter();
            warn!("Reader still blocked in open");
        }

        self.set_state(LifecycleState::Stopped);
        let _enter = self.span.enter();
        info!("Source is closed");
    }
}

impl Drop for SourceProvider {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Resolves once stop was requested or the provider is gone
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Open the FIFO on the blocking pool. Opening a FIFO waits for a writer;
/// `opening` stays set until the call returns.
async fn open_fifo(path: PathBuf, opening: Arc<AtomicBool>) -> std::io::Result<std::fs::File> {
    opening.store(true, Ordering::SeqCst);

    let result = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(path);
        opening.store(false, Ordering::SeqCst);
        file
    })
    .await;

    match result {
        Ok(file) => file,
        Err(e) => Err(std::io::Error::other(e)),
    }
}

/// How a single open of the FIFO ended
enum Outcome {
    /// Writer side closed or the open failed
    Closed,
    /// Stop was requested or the orchestrator is gone
    Finished,
}

/// State owned by the reader task
struct Reader {
    id: usize,
    path: PathBuf,
    mode: u32,
    separator: String,
    on_close: OnClose,
    state: Arc<RwLock<LifecycleState>>,
    events: mpsc::Sender<SourceEvent>,
    shutdown: watch::Receiver<bool>,
    reopens: Arc<AtomicU64>,
    opening: Arc<AtomicBool>,
    /// Whether the FIFO exists at `path` as far as the last attempt knows
    prepared: bool,
}

impl Reader {
    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run(mut self) {
        loop {
            let (outcome, failed) = if self.prepared {
                self.read_once().await
            } else {
                (Outcome::Closed, true)
            };
            if matches!(outcome, Outcome::Finished) || self.stopping() {
                return;
            }

            match self.on_close {
                OnClose::Ignore => {
                    info!("Source closed, ignoring");
                    *self.state.write() = LifecycleState::Stopped;
                    return;
                }
                OnClose::Reopen => {
                    self.reopens.fetch_add(1, Ordering::Relaxed);
                    debug!("Source closed, reopening");
                    if failed {
                        tokio::select! {
                            biased;
                            _ = stop_requested(&mut self.shutdown) => return,
                            _ = tokio::time::sleep(REOPEN_DELAY) => {}
                        }
                    }
                    self.prepared = match prepare_fifo(&self.path, self.mode) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("{}", e);
                            false
                        }
                    };
                }
                OnClose::Shutdown => {
                    info!("Source closed, shutting down");
                    let _ = self
                        .events
                        .send(SourceEvent::Closed { source: self.id })
                        .await;
                    return;
                }
            }
        }
    }

    /// Open the FIFO and forward lines until end of stream. The flag is set
    /// when the open itself failed.
    async fn read_once(&mut self) -> (Outcome, bool) {
        let file = tokio::select! {
            biased;
            _ = stop_requested(&mut self.shutdown) => return (Outcome::Finished, false),
            file = open_fifo(self.path.clone(), self.opening.clone()) => file,
        };
        let file = match file {
            Ok(file) => tokio::fs::File::from_std(file),
            Err(e) => {
                warn!("Cannot open source: {}", e);
                return (Outcome::Closed, true);
            }
        };

        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = tokio::select! {
                biased;
                _ = stop_requested(&mut self.shutdown) => return (Outcome::Finished, false),
                read = reader.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => return (Outcome::Closed, false),
                Ok(_) => {
                    if !self.forward(&buf).await {
                        return (Outcome::Finished, false);
                    }
                }
                Err(e) => {
                    warn!("Read error: {}", e);
                    return (Outcome::Closed, false);
                }
            }
        }
    }

    /// Frame one raw line and send it on. Returns false once the receiver
    /// is gone or stop was requested while the channel was full.
    async fn forward(&mut self, raw: &[u8]) -> bool {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return true;
        }

        let message = Message::frame(line, &self.separator);
        debug!("Read message on '{}'", message.topic);
        let event = SourceEvent::Message {
            source: self.id,
            message,
        };
        tokio::select! {
            biased;
            _ = stop_requested(&mut self.shutdown) => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("sensors/temp 21.5", " ", "sensors/temp", Some("21.5"); "topic and content")]
    #[test_case("heartbeat", " ", "heartbeat", None; "topic only")]
    #[test_case("a b c", " ", "a", Some("b c"); "first separator wins")]
    #[test_case(" leading", " ", " leading", None; "separator at start")]
    #[test_case("topic ", " ", "topic", Some(""); "empty content")]
    #[test_case("home/light::on", "::", "home/light", Some("on"); "multi char separator")]
    #[test_case("home/light on", "::", "home/light on", None; "separator absent")]
    fn test_frame(line: &str, separator: &str, topic: &str, content: Option<&str>) {
        let message = Message::frame(line, separator);
        assert_eq!(message.topic, topic);
        assert_eq!(message.content.as_deref(), content);
    }

    #[test]
    fn test_payload() {
        assert_eq!(
            Message::new("t", Some("21.5".into())).payload(),
            Bytes::from("21.5")
        );
        assert!(Message::new("t", None).payload().is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let (tx, _rx) = mpsc::channel(1);
        let config = SourceConfig {
            path: PathBuf::from("/nonexistent/fifo"),
            ..Default::default()
        };
        let mut provider = SourceProvider::new(0, &config, " ".into(), tx);
        provider.stop().await;
        assert_eq!(provider.state(), LifecycleState::Stopped);
    }

    fn uncreatable(on_close: OnClose) -> (tempfile::TempDir, SourceConfig) {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let config = SourceConfig {
            path: blocker.join("fifo"),
            on_close,
            ..Default::default()
        };
        (dir, config)
    }

    #[tokio::test]
    async fn test_uncreatable_fifo_reports_close() {
        let (_dir, config) = uncreatable(OnClose::Shutdown);
        let (tx, mut rx) = mpsc::channel(1);
        let mut provider = SourceProvider::new(3, &config, " ".into(), tx);

        provider.start().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(SourceEvent::Closed { source: 3 })));
        provider.stop().await;
        assert_eq!(provider.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_uncreatable_fifo_with_ignore_stays_stopped() {
        let (_dir, config) = uncreatable(OnClose::Ignore);
        let (tx, mut rx) = mpsc::channel(1);
        let mut provider = SourceProvider::new(0, &config, " ".into(), tx);

        provider.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while provider.state() != LifecycleState::Stopped {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_uncreatable_fifo_with_reopen_keeps_retrying() {
        let (_dir, config) = uncreatable(OnClose::Reopen);
        let (tx, mut rx) = mpsc::channel(1);
        let mut provider = SourceProvider::new(0, &config, " ".into(), tx);

        provider.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.reopen_count(), 1);
        assert_eq!(provider.state(), LifecycleState::Running);

        // Stop interrupts the retry delay
        tokio::time::timeout(Duration::from_millis(500), provider.stop())
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_with_full_channel_does_not_wait_for_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let config = SourceConfig {
            path: dir.path().join("fifo"),
            on_close: OnClose::Ignore,
            ..Default::default()
        };
        let (tx, _rx) = mpsc::channel(1);
        let mut provider = SourceProvider::new(0, &config, " ".into(), tx);
        provider.start().await.unwrap();

        let path = config.path.clone();
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut pipe = std::fs::OpenOptions::new().write(true).open(path).unwrap();
            pipe.write_all(b"a 1\nb 2\nc 3\n").unwrap();
        })
        .await
        .unwrap();
        // One message fills the channel, the reader now waits to send the next
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_millis(500), provider.stop())
            .await
            .unwrap();
        assert_eq!(provider.state(), LifecycleState::Stopped);
    }
}
