//! Pimper - FIFO to MQTT bridge
//!
//! Reads lines from named pipes, splits each one into a topic and a payload
//! and publishes it to every configured MQTT broker.

pub mod codec;
pub mod config;
pub mod lifecycle;
pub mod orchestrator;
pub mod protocol;
pub mod source;
pub mod target;
pub mod transport;

pub use config::{Config, ConfigResolver};
pub use lifecycle::{ExitCode, LifecycleState};
pub use orchestrator::Orchestrator;
pub use protocol::{ProtocolVersion, QoS};
pub use source::{Message, SourceProvider};
pub use target::TargetPublisher;
