//! Orchestrator
//!
//! Builds the sources and targets of a [`Config`], forwards every source
//! message to every target and drives the shutdown sequence. Signals,
//! panics and source closes all end up in [`Orchestrator::stop`].

mod signals;


pub use signals::{listen_for_signals, signal_name};

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::Config;
use crate::lifecycle::{ExitCode, LifecycleState};
use crate::source::{Message, Source, SourceEvent, SourceProvider};
use crate::target::{Target, TargetError, TargetPublisher};

/// Capacity of the channel carrying source events
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Requests from outside the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Termination signal with its number
    Signal(i32),
    /// Uncaught runtime fault
    Fault(String),
}

/// Cloneable handle used by signal listeners and the panic hook
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    control: mpsc::UnboundedSender<Control>,
}

impl OrchestratorHandle {
    /// Returns false once the orchestrator is gone
    pub fn signal(&self, signal: i32) -> bool {
        self.control.send(Control::Signal(signal)).is_ok()
    }

    /// Returns false once the orchestrator is gone
    pub fn fault(&self, cause: impl Into<String>) -> bool {
        self.control.send(Control::Fault(cause.into())).is_ok()
    }
}

/// Route panics from any thread or task into the orchestrator
pub fn install_panic_hook(handle: OrchestratorHandle) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        handle.fault(info.to_string());
    }));
}

/// Wires sources to targets and coordinates their lifecycle
pub struct Orchestrator {
    name: String,
    state: LifecycleState,
    shutdown_timeout: Duration,
    sources: Vec<Box<dyn Source>>,
    targets: Vec<Box<dyn Target>>,
    events_tx: mpsc::Sender<SourceEvent>,
    events_rx: mpsc::Receiver<SourceEvent>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    span: Span,
}

impl Orchestrator {
    /// Create an orchestrator with no sources or targets. A zero
    /// `shutdown_timeout` waits forever for instances to stop.
    pub fn new(name: &str, shutdown_timeout: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        Self {
            name: name.to_string(),
            state: LifecycleState::Stopped,
            shutdown_timeout,
            sources: Vec::new(),
            targets: Vec::new(),
            events_tx,
            events_rx,
            control_tx,
            control_rx,
            span: info_span!("pimper", name = %name),
        }
    }

    /// Build one publisher per target and one provider per source
    pub fn from_config(name: &str, config: &Config) -> Result<Self, TargetError> {
        let mut orchestrator = Self::new(name, config.shutdown_timeout);

        for target in &config.targets {
            let publisher = TargetPublisher::new(name, target)?;
            orchestrator.add_target(Box::new(publisher));
        }
        for source in &config.sources {
            let provider = SourceProvider::new(
                orchestrator.sources.len(),
                source,
                config.topic_separator_for(source),
                orchestrator.events(),
            );
            orchestrator.add_source(Box::new(provider));
        }

        Ok(orchestrator)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Sender sources report on. A source's id is its position in
    /// [`Orchestrator::add_source`] order.
    pub fn events(&self) -> mpsc::Sender<SourceEvent> {
        self.events_tx.clone()
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            control: self.control_tx.clone(),
        }
    }

    /// Returns the id of the added source
    pub fn add_source(&mut self, source: Box<dyn Source>) -> usize {
        self.sources.push(source);
        self.sources.len() - 1
    }

    pub fn add_target(&mut self, target: Box<dyn Target>) {
        self.targets.push(target);
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Start every target, then every source. A failing instance is logged
    /// and left stopped; the others are unaffected.
    pub async fn start(&mut self) {
        if self.state != LifecycleState::Stopped {
            return;
        }
        self.state = LifecycleState::Starting;
        let span = self.span.clone();

        async {
            for target in self.targets.iter_mut() {
                if let Err(e) = target.start().await {
                    error!("Failed to start target {}: {}", target.name(), e);
                }
            }
            for source in self.sources.iter_mut() {
                if let Err(e) = source.start().await {
                    error!("Failed to start source {}: {}", source.name(), e);
                }
            }
            info!(
                "Started with {} source(s) and {} target(s)",
                self.sources.len(),
                self.targets.len()
            );
        }
        .instrument(span)
        .await;

        self.state = LifecycleState::Running;
    }

    /// Send `message` to every target, in the order they were added
    pub fn fan_out(&self, message: &Message) {
        for target in &self.targets {
            target.publish(message);
        }
    }

    /// Start, then forward messages until something stops the orchestrator.
    /// Returns the exit code the process should end with.
    pub async fn run(&mut self) -> ExitCode {
        self.start().await;

        loop {
            let (code, cause) = tokio::select! {
                Some(event) = self.events_rx.recv() => match event {
                    SourceEvent::Message { message, .. } => {
                        self.fan_out(&message);
                        continue;
                    }
                    SourceEvent::Closed { source } => {
                        let name = self
                            .sources
                            .get(source)
                            .map(|s| s.name().to_string())
                            .unwrap_or_default();
                        (ExitCode::SUCCESS, format!("Source {} closed", name))
                    }
                },
                Some(control) = self.control_rx.recv() => match control {
                    Control::Signal(signal) => {
                        (ExitCode::from_signal(signal), signal_name(signal).to_string())
                    }
                    Control::Fault(cause) => (ExitCode::ERROR, cause),
                },
            };

            if let Some(code) = self.stop(code, &cause).await {
                return code;
            }
        }
    }

    /// Stop every source and target concurrently and wait for all of them,
    /// bounded by the shutdown timeout. Returns `code` once the sequence is
    /// complete, or `None` if already stopping or stopped.
    pub async fn stop(&mut self, code: ExitCode, cause: &str) -> Option<ExitCode> {
        if !self.state.is_active() {
            return None;
        }
        self.state = LifecycleState::Stopping;
        let span = self.span.clone();

        async {
            if code.is_fault() {
                error!("Stopping (Code: {}, Cause: {})", code, cause);
            } else {
                info!("Stopping (Code: {}, Cause: {})", code, cause);
            }

            let names: Vec<String> = self
                .sources
                .iter()
                .map(|s| s.name().to_string())
                .chain(self.targets.iter().map(|t| t.name().to_string()))
                .collect();
            let mut done = vec![false; names.len()];
            let source_count = self.sources.len();

            {
                let mut pending: FuturesUnordered<BoxFuture<'_, usize>> = FuturesUnordered::new();
                for (i, source) in self.sources.iter_mut().enumerate() {
                    pending.push(Box::pin(async move {
                        source.stop().await;
                        i
                    }));
                }
                for (i, target) in self.targets.iter_mut().enumerate() {
                    pending.push(Box::pin(async move {
                        target.stop(code, cause).await;
                        source_count + i
                    }));
                }

                let drain = async {
                    while let Some(i) = pending.next().await {
                        debug!("{} stopped", names[i]);
                        done[i] = true;
                    }
                };

                if self.shutdown_timeout.is_zero() {
                    drain.await;
                } else if tokio::time::timeout(self.shutdown_timeout, drain)
                    .await
                    .is_err()
                {
                    let stuck: Vec<&str> = names
                        .iter()
                        .zip(&done)
                        .filter(|(_, done)| !**done)
                        .map(|(name, _)| name.as_str())
                        .collect();
                    warn!(
                        "Shutdown timed out after {:?}, abandoning: {}",
                        self.shutdown_timeout,
                        stuck.join(", ")
                    );
                }
            }

            self.sources.clear();
            self.targets.clear();

            if code.is_fault() {
                error!("Stopped with exit code {}", code);
            } else if code.is_error() {
                info!("Stopped with exit code {}", code);
            } else {
                info!("Stopped successfully");
            }
        }
        .instrument(span)
        .await;

        self.state = LifecycleState::Stopped;
        Some(code)
    }
}
