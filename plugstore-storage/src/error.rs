//! Error taxonomy for storage operations.
//!
//! Every variant maps to a stable wire code so a transport layer can encode
//! failures without knowing the Rust types.

use plugstore_model::ErrorPayload;
use thiserror::Error;

pub const CODE_LIMIT_EXCEEDED: &str = "storage_limit_exceeded";
pub const CODE_QUERY_NOT_ALLOWED: &str = "storage_query_not_allowed";
pub const CODE_RATE_LIMITED: &str = "storage_rate_limited";
pub const CODE_RPC_TIMEOUT: &str = "storage_rpc_timeout";
pub const CODE_DDL_NOT_ALLOWED: &str = "storage_ddl_not_allowed";
pub const CODE_STORAGE_ERROR: &str = "storage_error";

/// All errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    LimitExceeded(String),

    #[error("{0}")]
    QueryNotAllowed(String),

    #[error("{0}")]
    RateLimited(String),

    #[error("{0}")]
    RpcTimeout(String),

    #[error("{0}")]
    DdlNotAllowed(String),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::LimitExceeded(_) => CODE_LIMIT_EXCEEDED,
            Self::QueryNotAllowed(_) => CODE_QUERY_NOT_ALLOWED,
            Self::RateLimited(_) => CODE_RATE_LIMITED,
            Self::RpcTimeout(_) => CODE_RPC_TIMEOUT,
            Self::DdlNotAllowed(_) => CODE_DDL_NOT_ALLOWED,
            Self::DuckDb(_) | Self::Json(_) | Self::Io(_) | Self::Internal(_) => CODE_STORAGE_ERROR,
        }
    }

    /// True when the same call may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::RpcTimeout(_))
    }

    /// Rebuild a typed error from a wire `{code, message}` pair.
    ///
    /// Unknown codes become [`StorageError::Internal`].
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            CODE_LIMIT_EXCEEDED => Self::LimitExceeded(message),
            CODE_QUERY_NOT_ALLOWED => Self::QueryNotAllowed(message),
            CODE_RATE_LIMITED => Self::RateLimited(message),
            CODE_RPC_TIMEOUT => Self::RpcTimeout(message),
            CODE_DDL_NOT_ALLOWED => Self::DdlNotAllowed(message),
            _ => Self::Internal(message),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
            ts: chrono::Utc::now(),
        }
    }

    pub(crate) fn not_allowed(message: impl Into<String>) -> Self {
        Self::QueryNotAllowed(message.into())
    }

    pub(crate) fn limit(message: impl Into<String>) -> Self {
        Self::LimitExceeded(message.into())
    }

    pub(crate) fn ddl(message: impl Into<String>) -> Self {
        Self::DdlNotAllowed(message.into())
    }
}

impl From<&ErrorPayload> for StorageError {
    fn from(payload: &ErrorPayload) -> Self {
        Self::from_code(&payload.code, payload.message.clone())
    }
}
