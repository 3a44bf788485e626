//! Read-only lookup over the loaded plugin configs.

use crate::error::{StorageError, StorageResult};
use crate::physical::{physical_index_name, physical_table_name};
use plugstore_model::{PluginStorageConfig, StorageDdlTableSpec, StorageLimits, StorageMode, StorageTableSpec};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Validated plugin configs, shared by every backend. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct PluginCatalog {
    configs: Arc<BTreeMap<String, PluginStorageConfig>>,
}

impl PluginCatalog {
    /// Wrap already validated configs (see `PluginStorageConfig::validated`).
    pub fn new(configs: BTreeMap<String, PluginStorageConfig>) -> Self {
        Self {
            configs: Arc::new(configs),
        }
    }

    pub fn config(&self, plugin_id: &str) -> StorageResult<&PluginStorageConfig> {
        self.configs.get(plugin_id).ok_or_else(|| {
            StorageError::not_allowed(format!("Storage config for plugin '{plugin_id}' is not defined"))
        })
    }

    pub fn limits(&self, plugin_id: &str) -> StorageResult<&StorageLimits> {
        self.config(plugin_id).map(|config| &config.limits)
    }

    pub fn table(&self, plugin_id: &str, table: &str) -> StorageResult<&StorageTableSpec> {
        self.config(plugin_id)?.table(table).ok_or_else(|| {
            StorageError::not_allowed(format!("Table '{table}' is not allowed for plugin '{plugin_id}'"))
        })
    }

    pub fn ddl_table(&self, plugin_id: &str, table: &str) -> StorageResult<&StorageDdlTableSpec> {
        let ddl = self.config(plugin_id)?.ddl.as_ref().ok_or_else(|| {
            StorageError::not_allowed(format!("Storage DDL for plugin '{plugin_id}' is not defined"))
        })?;
        ddl.table(table).ok_or_else(|| {
            StorageError::not_allowed(format!("Table '{table}' DDL is missing for plugin '{plugin_id}'"))
        })
    }

    pub fn plugin_ids(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    /// Plugins configured for physical mode, in id order.
    pub fn physical_plugins(&self) -> Vec<String> {
        self.configs
            .iter()
            .filter(|(_, config)| config.mode == StorageMode::Physical)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Fail if two declared tables would share a physical table or index.
    ///
    /// Sanitizing and truncation can map distinct plugin or table names onto
    /// the same identifier, so every plugin with DDL is checked together.
    pub fn check_physical_names(&self) -> StorageResult<()> {
        let mut tables: HashMap<String, (&str, &str)> = HashMap::new();
        let mut indexes: HashMap<String, (&str, &str)> = HashMap::new();
        for (plugin_id, config) in self.configs.iter() {
            let Some(ddl) = config.ddl.as_ref() else {
                continue;
            };
            for table in &config.tables {
                let physical = physical_table_name(plugin_id, &table.name)?;
                if let Some((other_plugin, other_table)) = tables.get(&physical) {
                    return Err(StorageError::ddl(format!(
                        "Physical table '{physical}' for plugin '{plugin_id}' table '{}' collides with plugin '{other_plugin}' table '{other_table}'",
                        table.name
                    )));
                }
                tables.insert(physical.clone(), (plugin_id.as_str(), table.name.as_str()));

                let Some(ddl_table) = ddl.table(&table.name) else {
                    continue;
                };
                for index in &ddl_table.indexes {
                    let name = physical_index_name(&physical, &index.name)?;
                    if let Some((other_plugin, other_index)) = indexes.get(&name) {
                        return Err(StorageError::ddl(format!(
                            "Physical index '{name}' for plugin '{plugin_id}' index '{}' collides with plugin '{other_plugin}' index '{other_index}'",
                            index.name
                        )));
                    }
                    indexes.insert(name, (plugin_id.as_str(), index.name.as_str()));
                }
            }
        }
        Ok(())
    }
}
