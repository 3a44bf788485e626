//! Migration error taxonomy.

use plugstore_storage::StorageError;
use thiserror::Error;

pub const CODE_INVALID_PAYLOAD: &str = "storage_migration_invalid_payload";
pub const CODE_TABLE_NOT_ALLOWED: &str = "storage_migration_table_not_allowed";
pub const CODE_MODE_MISMATCH: &str = "storage_migration_mode_mismatch";
pub const CODE_MISSING_DDL: &str = "storage_migration_missing_ddl";
pub const CODE_STRATEGY_NOT_SUPPORTED: &str = "storage_migration_strategy_not_supported";
pub const CODE_MIGRATION_FAILED: &str = "storage_migration_failed";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    TableNotAllowed(String),

    #[error("{0}")]
    ModeMismatch(String),

    #[error("{0}")]
    MissingDdl(String),

    #[error("{0}")]
    StrategyNotSupported(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl MigrationError {
    /// Stable wire code. Typed storage failures keep their own code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => CODE_INVALID_PAYLOAD,
            Self::TableNotAllowed(_) => CODE_TABLE_NOT_ALLOWED,
            Self::ModeMismatch(_) => CODE_MODE_MISMATCH,
            Self::MissingDdl(_) => CODE_MISSING_DDL,
            Self::StrategyNotSupported(_) => CODE_STRATEGY_NOT_SUPPORTED,
            Self::Storage(
                StorageError::DuckDb(_) | StorageError::Json(_) | StorageError::Io(_) | StorageError::Internal(_),
            ) => CODE_MIGRATION_FAILED,
            Self::Storage(e) => e.code(),
        }
    }

    /// HTTP-style status hint for a gateway in front of the engine.
    pub fn status(&self) -> u16 {
        match self {
            Self::ModeMismatch(_) => 409,
            Self::InvalidRequest(_)
            | Self::TableNotAllowed(_)
            | Self::MissingDdl(_)
            | Self::StrategyNotSupported(_) => 422,
            Self::Storage(StorageError::RateLimited(_)) => 429,
            Self::Storage(
                StorageError::LimitExceeded(_) | StorageError::QueryNotAllowed(_) | StorageError::DdlNotAllowed(_),
            ) => 422,
            Self::Storage(_) => 500,
        }
    }

    /// `code: message`, as carried by `migrate.failed` events.
    pub fn failure_label(&self) -> String {
        format!("{}: {}", self.code(), self)
    }
}

pub type MigrationResult<T> = Result<T, MigrationError>;
