//! Storage backend selector.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which backend owns a logical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StorageMode {
    /// Shared generic tables holding JSON payloads.
    #[default]
    #[serde(rename = "universal", alias = "core_universal")]
    Universal,
    /// One dedicated typed table per logical table.
    #[serde(rename = "physical", alias = "core_physical_tables")]
    Physical,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Universal => "universal",
            Self::Physical => "physical",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "universal" | "core_universal" => Ok(Self::Universal),
            "physical" | "core_physical_tables" => Ok(Self::Physical),
            other => Err(format!("Unsupported storage mode '{other}'")),
        }
    }
}
