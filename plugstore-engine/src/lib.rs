//! plugstore: multi-tenant storage for independently developed plugins.
//!
//! [`StorageEngine`] is the entry point. It owns one DuckDB database and
//! exposes the routed plugin storage API, a request/response dispatcher and
//! online migration of tables between storage modes.
//!
//! ```no_run
//! # async fn demo() -> plugstore_engine::EngineResult<()> {
//! use plugstore_engine::{EngineConfig, StorageEngine};
//!
//! let config = EngineConfig::from_toml_str(r#"plugins_path = "plugins.toml""#)?;
//! let _engine = StorageEngine::open(config).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod engine;
mod error;

pub use config::EngineConfig;
pub use engine::StorageEngine;
pub use error::{EngineError, EngineResult};
