//! Error types for configuration loading and validation.

use thiserror::Error;

/// Errors raised while loading or validating plugin storage configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid storage config: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}
