//! Configuration Module
//!
//! Resolves the bridge topology from three layers, merged in order:
//! - built-in defaults (one source, no targets)
//! - an optional configuration file (TOML, YAML or JSON by extension),
//!   with `${VAR}` / `${VAR:-default}` environment substitution
//! - command line overrides (`key.path=value` or a bare target URL)
//!
//! Legacy camelCase key names are accepted in the file and the overrides.
//! The merged tree is then deserialized into the typed [`Config`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use config::{File, FileFormat};
use regex::Regex;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::transport::Endpoint;

pub use args::{parse_overrides, Override, OverrideKind, ARG_SEPARATOR, DEFAULT_ARG_KEY};
pub use value::ConfigValue;

mod args;
mod legacy;
mod value;

#[cfg(test)]
mod tests;

/// Environment variable selecting the configuration file
pub const CONFIG_PATH_ENV: &str = "PIMPER_CONFIG_PATH";

/// Configuration file used when neither the CLI nor the environment names one
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pimper.toml";

/// Environment variable selecting the process name
pub const NAME_ENV: &str = "PIMPER_NAME";

pub const DEFAULT_NAME: &str = "pimper";

/// Process name used for log context, status topics and client ids
pub fn process_name() -> String {
    std::env::var(NAME_ENV)
        .ok()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_NAME.to_string())
}

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("environment pattern is valid")
});

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// Configuration file exists but cannot be read
    Io(PathBuf, std::io::Error),
    /// Config crate error (malformed document, type mismatch)
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Cannot read {}: {}", path.display(), e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(_, e) => Some(e),
            ConfigError::Config(e) => Some(e),
            ConfigError::Validation(_) => None,
        }
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Separator shared by every source that does not set its own
    pub topic_separator: Option<String>,
    /// Upper bound on graceful shutdown; zero waits forever
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub sources: Vec<SourceConfig>,
    pub targets: Vec<TargetConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            topic_separator: None,
            shutdown_timeout: default_shutdown_timeout(),
            sources: vec![SourceConfig::default()],
            targets: Vec::new(),
        }
    }
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// What a source does when the last writer closes its FIFO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnClose {
    /// Stop the whole process with a success exit code
    #[default]
    Shutdown,
    /// Stay stopped silently
    Ignore,
    /// Reopen the FIFO and keep reading
    Reopen,
}

impl fmt::Display for OnClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnClose::Shutdown => write!(f, "shutdown"),
            OnClose::Ignore => write!(f, "ignore"),
            OnClose::Reopen => write!(f, "reopen"),
        }
    }
}

/// FIFO source configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// FIFO path, created when missing
    pub path: PathBuf,
    /// Separator between topic and content; falls back to the shared one
    pub topic_separator: Option<String>,
    pub on_close: OnClose,
    /// Permission bits used when the FIFO is created
    #[serde(deserialize_with = "deserialize_mode")]
    pub mode: u32,
}

pub const DEFAULT_SOURCE_PATH: &str = "/var/run/pimper/source";
pub const DEFAULT_TOPIC_SEPARATOR: &str = " ";
pub const DEFAULT_FIFO_MODE: u32 = 0o622;

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_SOURCE_PATH),
            topic_separator: None,
            on_close: OnClose::default(),
            mode: DEFAULT_FIFO_MODE,
        }
    }
}

/// Accept permission bits as an integer (`0o622` in TOML) or as an octal
/// string (`"622"`, `"0622"`, `"0o622"`).
fn deserialize_mode<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    struct ModeVisitor;

    impl<'de> Visitor<'de> for ModeVisitor {
        type Value = u32;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("file permission bits as an integer or octal string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u32, E> {
            u32::try_from(v)
                .ok()
                .filter(|m| *m <= 0o7777)
                .ok_or_else(|| E::custom(format!("mode {:o} out of range", v)))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u32, E> {
            let v = u64::try_from(v).map_err(|_| E::custom("mode must not be negative"))?;
            self.visit_u64(v)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u32, E> {
            let digits = v.trim_start_matches("0o");
            let mode = u32::from_str_radix(digits, 8)
                .map_err(|_| E::custom(format!("invalid octal mode '{}'", v)))?;
            self.visit_u64(mode as u64)
        }
    }

    deserializer.deserialize_any(ModeVisitor)
}

/// MQTT target configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Broker URL, e.g. `mqtt://broker:1883` or `wss://broker/mqtt`
    pub url: String,
    /// Topic for connect/disconnect announcements; empty disables them
    pub status_topic: Option<String>,
    /// PEM file installed as CA material unless `options.ca` is set
    pub ca_file: Option<PathBuf>,
    pub options: ConnectionOptions,
}

impl TargetConfig {
    /// Status topic for this target: the configured one, else `<name>/status`
    pub fn status_topic(&self, name: &str) -> Option<String> {
        match self.status_topic.as_deref() {
            Some("") => None,
            Some(topic) => Some(topic.to_string()),
            None => Some(format!("{}/status", name)),
        }
    }

    pub fn parsed_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.url)
    }
}

/// MQTT connection options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Client identifier, `<name>_<random hex>` when unset
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep alive interval in seconds (0 disables)
    pub keep_alive: u16,
    pub clean_start: bool,
    /// MQTT protocol level: 4 (v3.1.1) or 5 (v5.0)
    pub protocol_version: u8,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Delay before reconnecting after a drop; zero disables reconnection
    #[serde(with = "humantime_serde")]
    pub reconnect_period: Duration,
    /// Inline PEM CA certificates
    pub ca: Option<String>,
    /// Inline PEM client certificate chain
    pub cert: Option<String>,
    /// Inline PEM client private key
    pub key: Option<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            username: None,
            password: None,
            keep_alive: 60,
            clean_start: true,
            protocol_version: 5,
            connect_timeout: Duration::from_secs(30),
            reconnect_period: Duration::from_secs(1),
            ca: None,
            cert: None,
            key: None,
        }
    }
}

/// `config` source over an already merged tree
#[derive(Debug, Clone)]
struct TreeSource(ConfigValue);

impl config::Source for TreeSource {
    fn clone_into_box(&self) -> Box<dyn config::Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<config::Map<String, config::Value>, config::ConfigError> {
        match self.0 {
            ConfigValue::Null => Ok(config::Map::new()),
            _ => config::Value::from(self.0.clone()).into_table(),
        }
    }
}

impl Config {
    /// Type and validate a merged configuration tree.
    ///
    /// String scalars (as produced by command line overrides) are converted
    /// to numbers and booleans where a field requires them.
    pub fn from_value(value: ConfigValue) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .add_source(TreeSource(value))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a standalone document (for testing, no layering)
    pub fn parse(content: &str, format: FileFormat) -> Result<Self, ConfigError> {
        let document = legacy::normalize(parse_document(content, format)?);
        Self::from_value(ConfigResolver::defaults().merge(document))
    }

    /// Separator a source actually splits on
    pub fn topic_separator_for(&self, source: &SourceConfig) -> String {
        source
            .topic_separator
            .clone()
            .or_else(|| self.topic_separator.clone())
            .unwrap_or_else(|| DEFAULT_TOPIC_SEPARATOR.to_string())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(sep) = &self.topic_separator {
            if sep.is_empty() {
                return Err(ConfigError::Validation(
                    "topic_separator must not be empty".to_string(),
                ));
            }
        }

        for (i, source) in self.sources.iter().enumerate() {
            if source.path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "sources[{}]: path must not be empty",
                    i
                )));
            }
            if source.topic_separator.as_deref() == Some("") {
                return Err(ConfigError::Validation(format!(
                    "sources[{}]: topic_separator must not be empty",
                    i
                )));
            }
        }

        for (i, target) in self.targets.iter().enumerate() {
            if target.url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "targets[{}]: url is required",
                    i
                )));
            }
            let url = target.parsed_url().map_err(|e| {
                ConfigError::Validation(format!("targets[{}]: invalid url '{}': {}", i, target.url, e))
            })?;
            Endpoint::from_url(&url)
                .map_err(|e| ConfigError::Validation(format!("targets[{}]: {}", i, e)))?;

            if !matches!(target.options.protocol_version, 4 | 5) {
                return Err(ConfigError::Validation(format!(
                    "targets[{}]: protocol_version must be 4 or 5",
                    i
                )));
            }
        }

        Ok(())
    }
}

/// Choose the document format from the file extension (TOML by default)
pub fn format_for_path(path: &Path) -> FileFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yml") | Some("yaml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        _ => FileFormat::Toml,
    }
}

/// Parse a configuration document into an untyped tree
pub fn parse_document(content: &str, format: FileFormat) -> Result<ConfigValue, ConfigError> {
    let value = config::Config::builder()
        .add_source(File::from_str(content, format))
        .build()?
        .try_deserialize::<ConfigValue>()?;
    Ok(value)
}

/// Merges defaults, the configuration file and command line overrides
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    path: PathBuf,
}

impl ConfigResolver {
    /// Use `path` if given, else `PIMPER_CONFIG_PATH`, else the default path
    pub fn new(path: Option<PathBuf>) -> Self {
        let path = path
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One empty source, no targets
    pub fn defaults() -> ConfigValue {
        let mut root = std::collections::BTreeMap::new();
        root.insert(
            "sources".to_string(),
            ConfigValue::Sequence(vec![ConfigValue::mapping()]),
        );
        root.insert("targets".to_string(), ConfigValue::Sequence(Vec::new()));
        ConfigValue::Mapping(root)
    }

    /// Read the configuration file. A missing path, or one that is not a
    /// regular file, yields `None`.
    pub fn read_file(&self) -> Result<Option<ConfigValue>, ConfigError> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration file at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(ConfigError::Io(self.path.clone(), e)),
        };

        if !metadata.is_file() {
            debug!(
                "Ignoring configuration path {}: not a regular file",
                self.path.display()
            );
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::Io(self.path.clone(), e))?;
        let substituted = substitute_env_vars(&content);
        parse_document(&substituted, format_for_path(&self.path)).map(Some)
    }

    /// Merge defaults, file and overrides into one tree
    pub fn resolve(&self, overrides: &[Override]) -> Result<ConfigValue, ConfigError> {
        let mut merged = Self::defaults();
        if let Some(file) = self.read_file()? {
            merged = merged.merge(legacy::normalize(file));
        }

        let from_args = legacy::normalize(args::overrides_to_value(overrides));
        debug!(
            "Configuration from args: {}",
            serde_json::to_string(&from_args).unwrap_or_default()
        );
        merged = merged.merge(from_args);

        debug!(
            "Configuration: {}",
            serde_json::to_string(&merged).unwrap_or_default()
        );
        Ok(merged)
    }

    /// Resolve and type the configuration
    pub fn load(&self, overrides: &[Override]) -> Result<Config, ConfigError> {
        Config::from_value(self.resolve(overrides)?)
    }
}
