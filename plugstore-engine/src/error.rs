use plugstore_migrate::MigrationError;
use plugstore_model::ConfigError;
use plugstore_storage::StorageError;
use thiserror::Error;

/// Errors raised while assembling or driving a [`StorageEngine`](crate::StorageEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
