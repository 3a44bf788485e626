//! TOML loading for plugin storage configs.
//!
//! ```toml
//! [plugins.inventory]
//! mode = "universal"
//!
//! [[plugins.inventory.tables]]
//! name = "widgets"
//! primary_key = "id"
//! indexes = ["color"]
//! ```

use crate::config::PluginStorageConfig;
use crate::error::{ConfigError, ConfigResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
struct PluginConfigBundle {
    #[serde(default)]
    plugins: BTreeMap<String, PluginStorageConfig>,
}

/// Load and validate every plugin config from a TOML file.
///
/// A missing file yields an empty map.
pub fn load_plugin_configs(path: &Path) -> ConfigResult<BTreeMap<String, PluginStorageConfig>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = std::fs::read_to_string(path)?;
    parse_plugin_configs(&content)
}

/// Parse and validate plugin configs from TOML text.
pub fn parse_plugin_configs(content: &str) -> ConfigResult<BTreeMap<String, PluginStorageConfig>> {
    let bundle: PluginConfigBundle = toml::from_str(content)?;
    bundle
        .plugins
        .into_iter()
        .map(|(plugin_id, config)| {
            if plugin_id.is_empty() || plugin_id.len() > 128 {
                return Err(ConfigError::Invalid(format!(
                    "plugin id must be 1..=128 characters, got '{plugin_id}'"
                )));
            }
            let config = config.validated().map_err(|e| match e {
                ConfigError::Invalid(msg) => ConfigError::Invalid(format!("plugin '{plugin_id}': {msg}")),
                other => other,
            })?;
            Ok((plugin_id, config))
        })
        .collect()
}
