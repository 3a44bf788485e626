//! Declarative schema used by physical mode.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Logical column type of a DDL column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageColumnType {
    String,
    Integer,
    Number,
    Boolean,
    Json,
    Datetime,
}

impl StorageColumnType {
    /// DuckDB column type used for the physical column.
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::String | Self::Json => "VARCHAR",
            Self::Integer => "BIGINT",
            Self::Number => "DOUBLE",
            Self::Boolean => "BOOLEAN",
            Self::Datetime => "TIMESTAMP",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Json => "json",
            Self::Datetime => "datetime",
        }
    }
}

/// A single declared column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDdlColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: StorageColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl StorageDdlColumnSpec {
    pub fn new(name: impl Into<String>, column_type: StorageColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable,
        }
    }
}

/// A declared secondary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDdlIndexSpec {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl StorageDdlIndexSpec {
    pub fn new(name: impl Into<String>, columns: &[&str], unique: bool) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique,
        }
    }

    fn normalize(&mut self) -> ConfigResult<()> {
        let mut seen = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let column = column.trim();
            if column.is_empty() || seen.iter().any(|c: &String| c == column) {
                continue;
            }
            seen.push(column.to_string());
        }
        if seen.is_empty() {
            return Err(ConfigError::invalid(format!(
                "Storage index '{}' must define at least one column",
                self.name
            )));
        }
        self.columns = seen;
        Ok(())
    }
}

/// Declared shape of one physical table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDdlTableSpec {
    pub name: String,
    pub primary_key: String,
    pub columns: Vec<StorageDdlColumnSpec>,
    #[serde(default)]
    pub indexes: Vec<StorageDdlIndexSpec>,
}

impl StorageDdlTableSpec {
    /// Look up a declared column by name.
    pub fn column(&self, name: &str) -> Option<&StorageDdlColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The primary key column is never nullable, whatever the declaration says.
    pub fn is_nullable(&self, column: &StorageDdlColumnSpec) -> bool {
        column.name != self.primary_key && column.nullable
    }

    pub(crate) fn normalize_and_validate(&mut self) -> ConfigResult<()> {
        check_name("DDL table", &self.name)?;
        if self.columns.is_empty() {
            return Err(ConfigError::invalid(format!(
                "DDL table '{}' must declare at least one column",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for column in &self.columns {
            check_name("DDL column", &column.name)?;
            if !names.insert(column.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "Duplicate DDL column '{}' in table '{}'",
                    column.name, self.name
                )));
            }
        }

        if !names.contains(self.primary_key.as_str()) {
            return Err(ConfigError::invalid(format!(
                "DDL table '{}' primary key '{}' is missing in columns",
                self.name, self.primary_key
            )));
        }

        for index in &mut self.indexes {
            check_name("DDL index", &index.name)?;
            index.normalize()?;
            if let Some(unknown) = index.columns.iter().find(|c| !names.contains(c.as_str())) {
                return Err(ConfigError::invalid(format!(
                    "DDL index '{}' references unknown field '{}' in table '{}'",
                    index.name, unknown, self.name
                )));
            }
        }
        Ok(())
    }
}

/// Versioned DDL for one plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDdlSpec {
    pub version: u32,
    #[serde(default)]
    pub tables: Vec<StorageDdlTableSpec>,
}

impl StorageDdlSpec {
    pub fn table(&self, name: &str) -> Option<&StorageDdlTableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub(crate) fn normalize_and_validate(&mut self) -> ConfigResult<()> {
        if self.version == 0 {
            return Err(ConfigError::invalid("DDL version must be >= 1"));
        }
        let mut names = HashSet::new();
        for table in &mut self.tables {
            table.normalize_and_validate()?;
            if !names.insert(table.name.clone()) {
                return Err(ConfigError::invalid(format!(
                    "Duplicate DDL table spec: {}",
                    table.name
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn check_name(kind: &str, name: &str) -> ConfigResult<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(ConfigError::invalid(format!(
            "{kind} name must be 1..=128 characters, got '{name}'"
        )));
    }
    Ok(())
}
