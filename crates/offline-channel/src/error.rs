//! Channel error types.

use thiserror::Error;

/// Channel error type.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Configuration rejected
    #[error("Config error: {0}")]
    Config(#[from] offline_config_and_utils::ConfigError),
}

/// Result type alias using ChannelError.
pub type ChannelResult<T> = Result<T, ChannelError>;
