//! Per-table dispatch between the universal and physical backends.

use crate::backend::{PluginStorage, StorageBackend};
use crate::catalog::PluginCatalog;
use crate::error::{StorageError, StorageResult};
use crate::physical::PhysicalStorage;
use crate::universal::UniversalStorage;
use async_trait::async_trait;
use plugstore_model::{PluginStorageConfig, Row, StorageMode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Answers whether a table is currently read-only because of a migration.
pub trait WriteLockProbe: Send + Sync {
    fn is_table_write_locked(&self, plugin_id: &str, table: &str) -> bool;

    /// Admit one write to `table`, or `None` while the table is read-only.
    ///
    /// The write counts as in flight until the permit drops. Probes that can
    /// be locked while writes are running must override this so the check
    /// and the registration happen atomically.
    fn begin_write(&self, plugin_id: &str, table: &str) -> Option<WritePermit> {
        (!self.is_table_write_locked(plugin_id, table)).then(WritePermit::untracked)
    }
}

/// An admitted write. Dropping it ends the write.
#[must_use = "the write is no longer tracked once the permit is dropped"]
pub struct WritePermit {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl WritePermit {
    /// A permit that runs `release` when dropped.
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A permit with nothing to release.
    pub fn untracked() -> Self {
        Self { release: None }
    }
}

impl Drop for WritePermit {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Routes every operation to the backend that owns the table.
///
/// A table belongs to its plugin's configured mode unless a migration has
/// installed an override; the override, while present, is authoritative.
pub struct StorageModeRouter {
    catalog: PluginCatalog,
    universal: Arc<UniversalStorage>,
    physical: Arc<PhysicalStorage>,
    write_locks: Option<Arc<dyn WriteLockProbe>>,
    overrides: RwLock<HashMap<(String, String), StorageMode>>,
}

impl StorageModeRouter {
    pub fn new(catalog: PluginCatalog, universal: Arc<UniversalStorage>, physical: Arc<PhysicalStorage>) -> Self {
        Self {
            catalog,
            universal,
            physical,
            write_locks: None,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Reject writes to tables the probe reports as locked.
    pub fn with_write_locks(mut self, probe: Arc<dyn WriteLockProbe>) -> Self {
        self.write_locks = Some(probe);
        self
    }

    pub fn get_plugin_config(&self, plugin_id: &str) -> StorageResult<&PluginStorageConfig> {
        self.catalog.config(plugin_id)
    }

    /// The override if present, else the plugin's configured mode.
    pub fn get_table_mode(&self, plugin_id: &str, table: &str) -> StorageResult<StorageMode> {
        let config = self.catalog.config(plugin_id)?;
        let overrides = self.overrides.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(overrides
            .get(&(plugin_id.to_string(), table.to_string()))
            .copied()
            .unwrap_or(config.mode))
    }

    pub fn set_table_mode(&self, plugin_id: &str, table: &str, mode: StorageMode) -> StorageResult<()> {
        self.catalog.config(plugin_id)?;
        self.overrides
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((plugin_id.to_string(), table.to_string()), mode);
        info!(plugin_id, table, mode = %mode, "Table mode override set");
        Ok(())
    }

    pub fn clear_table_mode_override(&self, plugin_id: &str, table: &str) {
        let removed = self
            .overrides
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(plugin_id.to_string(), table.to_string()));
        if removed.is_some() {
            info!(plugin_id, table, "Table mode override cleared");
        }
    }

    /// The backend serving `mode`.
    pub fn backend(&self, mode: StorageMode) -> &dyn StorageBackend {
        match mode {
            StorageMode::Universal => self.universal.as_ref(),
            StorageMode::Physical => self.physical.as_ref(),
        }
    }

    pub fn universal(&self) -> &Arc<UniversalStorage> {
        &self.universal
    }

    pub fn physical(&self) -> &Arc<PhysicalStorage> {
        &self.physical
    }

    fn table_backend(&self, plugin_id: &str, table: &str) -> StorageResult<&dyn StorageBackend> {
        Ok(self.backend(self.get_table_mode(plugin_id, table)?))
    }

    /// KV entries follow the plugin's configured mode.
    fn kv_backend(&self, plugin_id: &str) -> StorageResult<&dyn StorageBackend> {
        Ok(self.backend(self.catalog.config(plugin_id)?.mode))
    }

    /// Admit a write before its backend is resolved. The permit must be held
    /// until the backend call returns.
    fn admit_write(&self, plugin_id: &str, table: &str, operation: &str) -> StorageResult<WritePermit> {
        let Some(probe) = self.write_locks.as_ref() else {
            return Ok(WritePermit::untracked());
        };
        probe.begin_write(plugin_id, table).ok_or_else(|| {
            warn!(plugin_id, table, operation, "Write rejected during migration");
            StorageError::not_allowed(format!(
                "Storage table '{table}' for plugin '{plugin_id}' is read-only during migration; operation '{operation}' is denied"
            ))
        })
    }
}

#[async_trait]
impl PluginStorage for StorageModeRouter {
    async fn kv_get(&self, plugin_id: &str, key: &str, secret: bool) -> StorageResult<Option<Value>> {
        self.kv_backend(plugin_id)?.kv_get(plugin_id, key, secret).await
    }

    async fn kv_set(&self, plugin_id: &str, key: &str, value: &Value, secret: bool) -> StorageResult<()> {
        self.kv_backend(plugin_id)?.kv_set(plugin_id, key, value, secret).await
    }

    async fn kv_delete(&self, plugin_id: &str, key: &str) -> StorageResult<bool> {
        self.kv_backend(plugin_id)?.kv_delete(plugin_id, key).await
    }

    async fn table_get(&self, plugin_id: &str, table: &str, pk: &Value) -> StorageResult<Option<Row>> {
        self.table_backend(plugin_id, table)?.table_get(plugin_id, table, pk).await
    }

    async fn table_upsert(&self, plugin_id: &str, table: &str, row: &Row) -> StorageResult<Row> {
        let _permit = self.admit_write(plugin_id, table, "table_upsert")?;
        self.table_backend(plugin_id, table)?.table_upsert(plugin_id, table, row).await
    }

    async fn table_delete(&self, plugin_id: &str, table: &str, pk: &Value) -> StorageResult<bool> {
        let _permit = self.admit_write(plugin_id, table, "table_delete")?;
        self.table_backend(plugin_id, table)?.table_delete(plugin_id, table, pk).await
    }

    async fn table_query(
        &self,
        plugin_id: &str,
        table: &str,
        predicates: &Row,
        limit: Option<u32>,
    ) -> StorageResult<Vec<Row>> {
        self.table_backend(plugin_id, table)?
            .table_query(plugin_id, table, predicates, limit)
            .await
    }
}
