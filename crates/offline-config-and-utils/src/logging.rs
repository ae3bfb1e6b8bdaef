//! Logging initialization.
//!
//! Library crates only emit `tracing` events; hosts call one of these
//! functions once at startup to decide where those events go.

use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the host service, included in the startup line.
    pub service_name: String,
    /// Default level filter; `RUST_LOG` takes precedence.
    pub default_level: String,
    /// Emit structured JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "offline-channel".to_string(),
            default_level: crate::DEFAULT_LOG_LEVEL.to_string(),
            json: true,
        }
    }
}

/// Initialize structured JSON logging on stderr.
///
/// ```ignore
/// init_logging("info");
/// tracing::info!("Offline channel started");
/// ```
pub fn init_logging(level: &str) {
    init_logging_with(LogConfig {
        default_level: level.to_string(),
        ..LogConfig::default()
    });
}

/// Initialize logging with explicit settings. Calling it twice is harmless.
pub fn init_logging_with(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .try_init()
    };

    match result {
        Ok(()) => debug!(service = %config.service_name, "Logging initialized"),
        Err(_) => debug!("Global subscriber already set, keeping it"),
    }
}
