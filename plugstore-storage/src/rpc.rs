//! In-process dispatcher from request envelopes to storage calls.

use crate::backend::PluginStorage;
use crate::error::{StorageError, StorageResult};
use crate::quota::QuotaGuard;
use crate::router::StorageModeRouter;
use plugstore_model::{Row, StorageOp, StorageRequest, StorageResponse};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Turns [`StorageRequest`]s into storage calls and wraps every outcome,
/// success or failure, into a [`StorageResponse`].
pub struct StorageRpc {
    router: Arc<StorageModeRouter>,
}

impl StorageRpc {
    pub fn new(router: Arc<StorageModeRouter>) -> Self {
        Self { router }
    }

    pub async fn call(&self, request: StorageRequest) -> StorageResponse {
        match self.dispatch(&request).await {
            Ok(result) => StorageResponse::success(request.id, result),
            Err(error) => {
                debug!(plugin_id = %request.plugin_id, op = %request.op, code = error.code(), "Storage call failed");
                StorageResponse::failure(request.id, error.code(), error.to_string())
            }
        }
    }

    async fn dispatch(&self, request: &StorageRequest) -> StorageResult<Value> {
        let plugin_id = request.plugin_id.as_str();
        let secret = request.secret.unwrap_or(false);
        match request.op {
            StorageOp::KvGet => {
                let key = require_key(request.key.as_ref())?;
                let value = self.router.kv_get(plugin_id, key, secret).await?;
                Ok(json!({ "value": value }))
            }
            StorageOp::KvSet => {
                let key = require_key(request.key.as_ref())?;
                let row = require_row(request.row.as_ref(), "row")?;
                let value = row
                    .get("value")
                    .ok_or_else(|| StorageError::not_allowed("kv.set requires row.value"))?;
                self.router.kv_set(plugin_id, key, value, secret).await?;
                Ok(json!({ "ok": true }))
            }
            StorageOp::KvDelete => {
                let key = require_key(request.key.as_ref())?;
                let deleted = self.router.kv_delete(plugin_id, key).await?;
                Ok(json!({ "deleted": deleted }))
            }
            StorageOp::TableGet => {
                let table = require_table(request.table.as_deref())?;
                let pk = require_value(request.key.as_ref(), "key")?;
                let row = self.router.table_get(plugin_id, table, pk).await?;
                Ok(json!({ "row": row }))
            }
            StorageOp::TableUpsert => {
                let table = require_table(request.table.as_deref())?;
                let row = require_row(request.row.as_ref(), "row")?;
                let stored = self.router.table_upsert(plugin_id, table, row).await?;
                Ok(json!({ "row": stored }))
            }
            StorageOp::TableDelete => {
                let table = require_table(request.table.as_deref())?;
                let pk = require_value(request.key.as_ref(), "key")?;
                let deleted = self.router.table_delete(plugin_id, table, pk).await?;
                Ok(json!({ "deleted": deleted }))
            }
            StorageOp::TableQuery => {
                let table = require_table(request.table.as_deref())?;
                let predicates = require_row(request.predicates.as_ref(), "where")?;
                let limits = &self.router.get_plugin_config(plugin_id)?.limits;
                let limit = QuotaGuard::clamp_query_limit(request.limit, limits)?;
                let rows = self.router.table_query(plugin_id, table, predicates, Some(limit)).await?;
                Ok(json!({ "rows": rows }))
            }
        }
    }
}

fn require_key(key: Option<&Value>) -> StorageResult<&str> {
    key.and_then(Value::as_str)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| StorageError::not_allowed("key is required"))
}

fn require_table(table: Option<&str>) -> StorageResult<&str> {
    table
        .filter(|table| !table.is_empty())
        .ok_or_else(|| StorageError::not_allowed("table is required"))
}

fn require_value<'a>(value: Option<&'a Value>, field: &str) -> StorageResult<&'a Value> {
    value
        .filter(|v| !v.is_null())
        .ok_or_else(|| StorageError::not_allowed(format!("{field} is required")))
}

fn require_row<'a>(value: Option<&'a Row>, field: &str) -> StorageResult<&'a Row> {
    value.ok_or_else(|| StorageError::not_allowed(format!("{field} must be an object")))
}
