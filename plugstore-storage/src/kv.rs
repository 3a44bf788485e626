//! Plugin key-value entries, shared by both backends.

use crate::catalog::PluginCatalog;
use crate::db::{now_millis, StorageDb};
use crate::error::{StorageError, StorageResult};
use crate::quota::QuotaGuard;
use duckdb::params;
use plugstore_model::StorageOp;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// KV operations over the `plugin_kv` table.
///
/// Both storage modes keep KV entries here, so switching a plugin's tables
/// between modes never moves KV data.
#[derive(Clone)]
pub struct KvStore {
    db: StorageDb,
    catalog: PluginCatalog,
    quota: Arc<QuotaGuard>,
}

impl KvStore {
    pub fn new(db: StorageDb, catalog: PluginCatalog, quota: Arc<QuotaGuard>) -> Self {
        Self { db, catalog, quota }
    }

    /// Read a value. Secret entries require `secret = true`.
    pub async fn get(&self, plugin_id: &str, key: &str, secret: bool) -> StorageResult<Option<Value>> {
        let limits = self.catalog.limits(plugin_id)?;
        self.quota.consume(plugin_id, StorageOp::KvGet, limits)?;

        let (plugin, key) = (plugin_id.to_string(), key.to_string());
        let stored = self
            .db
            .run(move |conn| {
                let result = conn.query_row(
                    "SELECT value, is_secret FROM plugin_kv WHERE plugin_id = ? AND key = ?",
                    params![plugin, key],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
                );
                match result {
                    Ok(found) => Ok(Some(found)),
                    Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        match stored {
            None => Ok(None),
            Some((_, true)) if !secret => Err(StorageError::not_allowed(
                "Secret key access requires secret=true",
            )),
            Some((value, _)) => Ok(Some(serde_json::from_str(&value)?)),
        }
    }

    /// Store a value in canonical form, replacing any previous entry.
    pub async fn set(&self, plugin_id: &str, key: &str, value: &Value, secret: bool) -> StorageResult<()> {
        let limits = self.catalog.limits(plugin_id)?;
        self.quota.consume(plugin_id, StorageOp::KvSet, limits)?;
        let (serialized, bytes) = QuotaGuard::enforce_kv_bytes(value, limits)?;

        let (plugin, key) = (plugin_id.to_string(), key.to_string());
        debug!(plugin_id = %plugin, key = %key, bytes, secret, "KV set");
        self.db
            .run(move |conn| {
                conn.execute(
                    r#"INSERT INTO plugin_kv (plugin_id, key, value, is_secret, value_bytes, updated_at)
                       VALUES (?, ?, ?, ?, ?, ?)
                       ON CONFLICT (plugin_id, key) DO UPDATE SET
                           value = excluded.value,
                           is_secret = excluded.is_secret,
                           value_bytes = excluded.value_bytes,
                           updated_at = excluded.updated_at"#,
                    params![plugin, key, serialized, secret, bytes as i64, now_millis()],
                )?;
                Ok(())
            })
            .await
    }

    /// Remove an entry. Returns whether it existed.
    pub async fn delete(&self, plugin_id: &str, key: &str) -> StorageResult<bool> {
        let limits = self.catalog.limits(plugin_id)?;
        self.quota.consume(plugin_id, StorageOp::KvDelete, limits)?;

        let (plugin, key) = (plugin_id.to_string(), key.to_string());
        self.db
            .run(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM plugin_kv WHERE plugin_id = ? AND key = ?",
                    params![plugin, key],
                )?;
                Ok(deleted > 0)
            })
            .await
    }
}
