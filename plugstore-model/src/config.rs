//! Per-plugin storage configuration and resource limits.

use crate::ddl::{check_name, StorageDdlSpec};
use crate::error::{ConfigError, ConfigResult};
use crate::mode::StorageMode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Resource ceilings enforced on every storage call for one plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageLimits {
    pub max_tables: usize,
    pub max_rows_per_table: u64,
    pub max_row_bytes: usize,
    pub max_kv_bytes: usize,
    pub max_qps: f64,
    pub max_query_limit: u32,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            max_tables: 32,
            max_rows_per_table: 50_000,
            max_row_bytes: 32_768,
            max_kv_bytes: 16_384,
            max_qps: 50.0,
            max_query_limit: 200,
        }
    }
}

impl StorageLimits {
    pub fn validate(&self) -> ConfigResult<()> {
        check_range("max_tables", self.max_tables as f64, 1.0, 10_000.0)?;
        check_range("max_rows_per_table", self.max_rows_per_table as f64, 1.0, 10_000_000.0)?;
        check_range("max_row_bytes", self.max_row_bytes as f64, 32.0, 10_000_000.0)?;
        check_range("max_kv_bytes", self.max_kv_bytes as f64, 32.0, 10_000_000.0)?;
        check_range("max_query_limit", f64::from(self.max_query_limit), 1.0, 10_000.0)?;
        if !(self.max_qps > 0.0 && self.max_qps <= 100_000.0) {
            return Err(ConfigError::invalid(format!(
                "max_qps must be in (0, 100000], got {}",
                self.max_qps
            )));
        }
        Ok(())
    }
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> ConfigResult<()> {
    if value < min || value > max {
        return Err(ConfigError::invalid(format!(
            "{field} must be in [{min}, {max}], got {value}"
        )));
    }
    Ok(())
}

/// A logical table a plugin is allowed to use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageTableSpec {
    pub name: String,
    pub primary_key: String,
    #[serde(default)]
    pub indexes: Vec<String>,
}

impl StorageTableSpec {
    /// Build a table spec with normalized index fields.
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>, indexes: &[&str]) -> Self {
        let mut spec = Self {
            name: name.into(),
            primary_key: primary_key.into(),
            indexes: indexes.iter().map(|i| i.to_string()).collect(),
        };
        spec.normalize();
        spec
    }

    /// Trim index fields and drop empties, duplicates and the primary key.
    pub fn normalize(&mut self) {
        let mut normalized: Vec<String> = Vec::with_capacity(self.indexes.len());
        for field in &self.indexes {
            let field = field.trim();
            if field.is_empty() || field == self.primary_key {
                continue;
            }
            if !normalized.iter().any(|f| f == field) {
                normalized.push(field.to_string());
            }
        }
        self.indexes = normalized;
    }

    /// Fields usable in equality predicates: the primary key plus declared indexes.
    pub fn is_queryable(&self, field: &str) -> bool {
        field == self.primary_key || self.indexes.iter().any(|f| f == field)
    }
}

/// Storage configuration for a single plugin. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PluginStorageConfig {
    #[serde(default)]
    pub mode: StorageMode,
    #[serde(default)]
    pub ddl: Option<StorageDdlSpec>,
    #[serde(default)]
    pub limits: StorageLimits,
    #[serde(default)]
    pub tables: Vec<StorageTableSpec>,
}

impl PluginStorageConfig {
    pub fn table(&self, name: &str) -> Option<&StorageTableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Normalize table specs and check every cross-field invariant.
    pub fn validated(mut self) -> ConfigResult<Self> {
        self.limits.validate()?;

        let mut names = HashSet::new();
        for table in &mut self.tables {
            check_name("Storage table", &table.name)?;
            check_name("Primary key", &table.primary_key)?;
            table.normalize();
            if !names.insert(table.name.clone()) {
                return Err(ConfigError::invalid(format!(
                    "Duplicate storage table spec: {}",
                    table.name
                )));
            }
        }
        if names.len() > self.limits.max_tables {
            return Err(ConfigError::invalid(
                "Configured storage tables exceed max_tables limit",
            ));
        }

        if let Some(ddl) = self.ddl.as_mut() {
            ddl.normalize_and_validate()?;
        }

        if self.mode == StorageMode::Physical && self.ddl.is_none() {
            return Err(ConfigError::invalid(
                "Storage DDL spec is required for physical mode",
            ));
        }

        // A universal plugin may carry DDL as the target schema of a later
        // migration; it is held to the same coverage rules.
        if let Some(ddl) = self.ddl.as_ref() {
            for table in &self.tables {
                let ddl_table = ddl.table(&table.name).ok_or_else(|| {
                    ConfigError::invalid(format!(
                        "Storage table '{}' is not present in DDL tables",
                        table.name
                    ))
                })?;
                if ddl_table.primary_key != table.primary_key {
                    return Err(ConfigError::invalid(format!(
                        "Storage table '{}' primary key mismatch between tables and ddl specs",
                        table.name
                    )));
                }
                for field in &table.indexes {
                    let covered = ddl_table
                        .indexes
                        .iter()
                        .any(|index| index.columns.iter().any(|c| c == field));
                    if !covered {
                        return Err(ConfigError::invalid(format!(
                            "Storage table '{}' index '{}' must be declared in DDL indexes",
                            table.name, field
                        )));
                    }
                }
            }
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddl::{StorageColumnType, StorageDdlColumnSpec, StorageDdlIndexSpec, StorageDdlTableSpec};

    fn physical_config() -> PluginStorageConfig {
        PluginStorageConfig {
            mode: StorageMode::Physical,
            ddl: Some(StorageDdlSpec {
                version: 1,
                tables: vec![StorageDdlTableSpec {
                    name: "widgets".into(),
                    primary_key: "id".into(),
                    columns: vec![
                        StorageDdlColumnSpec::new("id", StorageColumnType::Integer, false),
                        StorageDdlColumnSpec::new("color", StorageColumnType::String, true),
                    ],
                    indexes: vec![StorageDdlIndexSpec::new("by_color", &["color"], false)],
                }],
            }),
            limits: StorageLimits::default(),
            tables: vec![StorageTableSpec::new("widgets", "id", &["color"])],
        }
    }

    #[test]
    fn table_spec_normalizes_indexes() {
        let spec = StorageTableSpec::new("t", "id", &[" color", "id", "", "color", "size"]);
        assert_eq!(spec.indexes, vec!["color".to_string(), "size".to_string()]);
        assert!(spec.is_queryable("id"));
        assert!(spec.is_queryable("size"));
        assert!(!spec.is_queryable("name"));
    }

    #[test]
    fn physical_config_is_valid() {
        assert!(physical_config().validated().is_ok());
    }

    #[test]
    fn physical_mode_requires_ddl() {
        let mut config = physical_config();
        config.ddl = None;
        assert!(config.validated().is_err());
    }

    #[test]
    fn universal_mode_may_declare_target_ddl() {
        let mut config = physical_config();
        config.mode = StorageMode::Universal;
        assert!(config.validated().is_ok());
    }

    #[test]
    fn target_ddl_must_cover_tables() {
        let mut config = physical_config();
        config.mode = StorageMode::Universal;
        config.tables.push(StorageTableSpec::new("gadgets", "id", &[]));
        let err = config.validated().unwrap_err();
        assert!(err.to_string().contains("'gadgets' is not present"));
    }

    #[test]
    fn index_must_be_covered_by_ddl() {
        let mut config = physical_config();
        config.tables[0].indexes.push("size".into());
        let err = config.validated().unwrap_err();
        assert!(err.to_string().contains("index 'size'"));
    }

    #[test]
    fn primary_key_must_match_ddl() {
        let mut config = physical_config();
        config.tables[0].primary_key = "uuid".into();
        assert!(config.validated().is_err());
    }

    #[test]
    fn table_count_bounded_by_max_tables() {
        let config = PluginStorageConfig {
            limits: StorageLimits {
                max_tables: 1,
                ..StorageLimits::default()
            },
            tables: vec![
                StorageTableSpec::new("a", "id", &[]),
                StorageTableSpec::new("b", "id", &[]),
            ],
            ..PluginStorageConfig::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn limits_out_of_range_rejected() {
        let limits = StorageLimits {
            max_qps: 0.0,
            ..StorageLimits::default()
        };
        assert!(limits.validate().is_err());
        let limits = StorageLimits {
            max_kv_bytes: 8,
            ..StorageLimits::default()
        };
        assert!(limits.validate().is_err());
    }
}
