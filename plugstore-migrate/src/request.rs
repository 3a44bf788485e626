//! Migration request and report types.

use crate::error::{MigrationError, MigrationResult};
use plugstore_model::StorageMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const MAX_BATCH_SIZE: usize = 10_000;

/// How writers are treated while a table is copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStrategy {
    /// Writes are rejected for the whole migration.
    #[default]
    ReadOnlyLock,
    /// Accepted on input, not supported by the runner.
    DualWrite,
}

impl MigrationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnlyLock => "read_only_lock",
            Self::DualWrite => "dual_write",
        }
    }
}

impl fmt::Display for MigrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// Move `tables` of one plugin from `from_mode` to `to_mode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub plugin_id: String,
    pub from_mode: StorageMode,
    pub to_mode: StorageMode,
    pub tables: Vec<String>,
    #[serde(default)]
    pub strategy: MigrationStrategy,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl MigrationRequest {
    pub fn new(plugin_id: impl Into<String>, from_mode: StorageMode, to_mode: StorageMode, tables: &[&str]) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            from_mode,
            to_mode,
            tables: tables.iter().map(|t| t.to_string()).collect(),
            strategy: MigrationStrategy::default(),
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_strategy(mut self, strategy: MigrationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Trim and de-duplicate tables (keeping first occurrence order) and
    /// check the payload-level constraints.
    pub fn normalized(mut self) -> MigrationResult<Self> {
        let plugin_id = self.plugin_id.trim();
        if plugin_id.is_empty() || plugin_id.len() > 128 {
            return Err(MigrationError::InvalidRequest(
                "plugin_id must be 1..=128 characters".into(),
            ));
        }
        self.plugin_id = plugin_id.to_string();

        let mut tables: Vec<String> = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            let table = table.trim();
            if !table.is_empty() && !tables.iter().any(|t| t == table) {
                tables.push(table.to_string());
            }
        }
        if tables.is_empty() {
            return Err(MigrationError::InvalidRequest(
                "Storage migration requires at least one table".into(),
            ));
        }
        self.tables = tables;

        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(MigrationError::InvalidRequest(format!(
                "batch_size must be in [1, {MAX_BATCH_SIZE}], got {}",
                self.batch_size
            )));
        }
        if self.from_mode == self.to_mode {
            return Err(MigrationError::InvalidRequest(
                "Storage migration from_mode and to_mode must be different".into(),
            ));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    /// Dry run: counted, nothing copied.
    Planned,
    Completed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlanEntry {
    pub table: String,
    pub rows: u64,
}

/// Outcome of one migration call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub migration_id: Uuid,
    pub plugin_id: String,
    pub from_mode: StorageMode,
    pub to_mode: StorageMode,
    pub strategy: MigrationStrategy,
    pub dry_run: bool,
    pub tables: Vec<String>,
    pub plan: Vec<MigrationPlanEntry>,
    pub copied_rows: BTreeMap<String, u64>,
    pub switched_tables: Vec<String>,
    pub status: MigrationStatus,
}
