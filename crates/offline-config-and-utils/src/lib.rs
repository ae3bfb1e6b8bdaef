//! Configuration, paths and logging for the offline telemetry channel.

mod config;
mod endpoint;
mod error;
pub mod logging;
mod paths;

pub use config::{
    OfflineChannelConfig, DEFAULT_LOG_LEVEL, DEFAULT_RETRY_CODES, MAX_PROVIDER_PREFERENCES,
};
pub use endpoint::endpoint_domain;
pub use error::{ConfigError, ConfigResult};
pub use logging::{init_logging, init_logging_with, LogConfig};
pub use paths::Paths;
