//! Pimper - FIFO to MQTT bridge
//!
//! Usage:
//!   pimper [OPTIONS] [OVERRIDE]...
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (default: $PIMPER_CONFIG_PATH
//!                          or /etc/pimper.toml)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help
//!
//! Each OVERRIDE is `key.path=value` (e.g. `targets.0.url=mqtt://broker`) or
//! a bare broker URL.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pimper::config::{parse_overrides, process_name, Config, ConfigResolver, Override, OverrideKind};
use pimper::lifecycle::ExitCode;
use pimper::orchestrator::{install_panic_hook, listen_for_signals, Orchestrator};

/// Time the runtime gets to wind down blocking FIFO operations
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// Pimper - FIFO to MQTT bridge
#[derive(Parser, Debug)]
#[command(name = "pimper")]
#[command(author = "Pimper Contributors")]
#[command(version)]
#[command(about = "Publish lines written to named pipes to MQTT brokers")]
struct Args {
    /// Configuration file path (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    /// Configuration overrides (`key.path=value`) or a bare broker URL
    #[arg(value_name = "OVERRIDE")]
    overrides: Vec<String>,
}

fn init_logging(level: LogLevel) -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG wins over the CLI and the config file
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_tracing_level().as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn log_overrides(overrides: &[Override]) {
    for o in overrides {
        match o.kind {
            OverrideKind::KeyPath => info!("Override {} = {}", o.key, o.value),
            OverrideKind::BareUrl => info!("Using {} as {}", o.raw, o.key),
            OverrideKind::Unqualified => warn!(
                "Argument '{}' is neither key=value nor a URL, using it as {}",
                o.raw, o.key
            ),
        }
    }
}

async fn run(name: String, config: Config) -> ExitCode {
    let mut orchestrator = match Orchestrator::from_config(&name, &config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("Invalid target: {}", e);
            return ExitCode::ERROR;
        }
    };

    install_panic_hook(orchestrator.handle());
    if let Err(e) = listen_for_signals(orchestrator.handle()) {
        error!("Cannot install signal handlers: {}", e);
        return ExitCode::ERROR;
    }

    orchestrator.run().await
}

fn main() {
    let args = Args::parse();
    let name = process_name();
    let overrides = parse_overrides(&args.overrides);

    let resolver = ConfigResolver::new(args.config.clone());
    let config = match resolver.load(&overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(ExitCode::ERROR.code());
        }
    };

    // Setup logging - CLI overrides config
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));
    if let Err(e) = init_logging(log_level) {
        eprintln!("Error initialising logging: {}", e);
        std::process::exit(ExitCode::ERROR.code());
    }

    info!("Pimper v{} starting as '{}'", env!("CARGO_PKG_VERSION"), name);
    info!("Configuration: {}", resolver.path().display());
    log_overrides(&overrides);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Cannot build runtime: {}", e);
            std::process::exit(ExitCode::ERROR.code());
        }
    };

    let code = runtime.block_on(run(name, config));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    std::process::exit(code.code());
}
