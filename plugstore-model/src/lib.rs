//! Shared types for the plugstore plugin storage engine.
//!
//! Everything here is static configuration or plain data: per-plugin storage
//! configs and limits, the declarative DDL schema used by physical mode, the
//! storage mode enum, canonical JSON helpers and the request/response
//! envelopes a transport layer exchanges with the engine.
//!
//! # Architecture
//!
//! - Configs are validated once at load time and are immutable afterwards
//! - Canonical JSON (RFC 8785) is the single encoding used for byte sizes,
//!   primary-key encoding and index values
//! - Request/response envelopes carry stable error codes, not Rust types

mod canonical;
mod config;
mod ddl;
mod error;
mod loader;
mod mode;
mod request;

pub use canonical::{canonical_json, canonical_len, is_scalar, Row};
pub use config::{PluginStorageConfig, StorageLimits, StorageTableSpec};
pub use ddl::{StorageColumnType, StorageDdlColumnSpec, StorageDdlIndexSpec, StorageDdlSpec, StorageDdlTableSpec};
pub use error::{ConfigError, ConfigResult};
pub use loader::{load_plugin_configs, parse_plugin_configs};
pub use mode::StorageMode;
pub use request::{ErrorPayload, StorageOp, StorageRequest, StorageResponse};
