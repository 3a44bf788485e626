//! Engine configuration.

use crate::error::EngineResult;
use plugstore_migrate::DEFAULT_BATCH_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for a [`StorageEngine`](crate::StorageEngine).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// DuckDB file. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,

    /// Plugin storage configs (`[plugins.<id>]` TOML). A missing file means no plugins.
    pub plugins_path: Option<PathBuf>,

    /// DuckDB `memory_limit` pragma.
    pub memory_limit: String,

    /// DuckDB worker threads.
    pub threads: u32,

    /// Batch size for migrations built through the engine.
    pub default_batch_size: usize,

    /// Provision physical tables of physical-mode plugins at startup instead
    /// of on first use.
    pub install_on_open: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            plugins_path: None,
            memory_limit: "256MB".to_string(),
            threads: 2,
            default_batch_size: DEFAULT_BATCH_SIZE,
            install_on_open: true,
        }
    }
}

impl EngineConfig {
    /// In-memory engine config, for tests and tooling.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Read a TOML engine config file.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        Ok(toml::from_str(content)?)
    }
}
