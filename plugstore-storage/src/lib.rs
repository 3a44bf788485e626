//! DuckDB storage engine for plugin data.
//!
//! Plugins persist key-value entries and rows of declared logical tables
//! without touching the database directly. Each table is served by one of two
//! backends and can be moved between them by a migration.
//!
//! # Architecture
//!
//! - [`UniversalStorage`] keeps arbitrary JSON rows in shared generic tables
//!   with secondary index entries rebuilt on every write
//! - [`PhysicalStorage`] provisions one typed table per logical table through
//!   the additive-only [`SafeDdlEngine`]
//! - [`StorageModeRouter`] picks the backend per table and blocks writes to
//!   tables under migration
//! - [`QuotaGuard`] enforces per-plugin QPS, byte and query-limit ceilings
//! - [`StorageRpc`] adapts request/response envelopes for a transport layer

mod backend;
mod catalog;
mod db;
mod error;
mod kv;
pub mod physical;
mod quota;
mod router;
mod rpc;
mod universal;

pub use backend::{PluginStorage, RowCursor, StorageBackend};
pub use catalog::PluginCatalog;
pub use db::{initialize_storage_schema, open_duckdb_with_wal_recovery, StorageDb};
pub use error::{StorageError, StorageResult};
pub use kv::KvStore;
pub use physical::{PhysicalStorage, SafeDdlEngine};
pub use quota::QuotaGuard;
pub use router::{StorageModeRouter, WriteLockProbe, WritePermit};
pub use rpc::StorageRpc;
pub use universal::UniversalStorage;
