//! Backend traits shared by both storage modes and the router.

use crate::error::StorageResult;
use async_trait::async_trait;
use plugstore_model::{Row, StorageMode};
use serde_json::Value;

/// Opaque position of a row in a backend's primary-key order.
///
/// Universal mode uses the canonical pk encoding, physical mode the decoded pk
/// value. A cursor is only meaningful to the backend that produced it.
pub type RowCursor = Value;

/// The plugin-facing storage operations.
#[async_trait]
pub trait PluginStorage: Send + Sync {
    async fn kv_get(&self, plugin_id: &str, key: &str, secret: bool) -> StorageResult<Option<Value>>;

    async fn kv_set(&self, plugin_id: &str, key: &str, value: &Value, secret: bool) -> StorageResult<()>;

    async fn kv_delete(&self, plugin_id: &str, key: &str) -> StorageResult<bool>;

    async fn table_get(&self, plugin_id: &str, table: &str, pk: &Value) -> StorageResult<Option<Row>>;

    async fn table_upsert(&self, plugin_id: &str, table: &str, row: &Row) -> StorageResult<Row>;

    async fn table_delete(&self, plugin_id: &str, table: &str, pk: &Value) -> StorageResult<bool>;

    /// Equality-AND query over the primary key and declared index fields.
    ///
    /// An absent `limit` means the plugin's `max_query_limit`.
    async fn table_query(
        &self,
        plugin_id: &str,
        table: &str,
        predicates: &Row,
        limit: Option<u32>,
    ) -> StorageResult<Vec<Row>>;
}

/// A concrete backend: plugin operations plus the maintenance paths used by
/// the migration runner. Maintenance calls skip rate limiting.
#[async_trait]
pub trait StorageBackend: PluginStorage {
    fn mode(&self) -> StorageMode;

    /// Make the backend ready to serve `plugin_id` (provision schema, etc).
    async fn prepare_plugin(&self, plugin_id: &str) -> StorageResult<()>;

    async fn count_table_rows(&self, plugin_id: &str, table: &str) -> StorageResult<u64>;

    /// Up to `batch_size` rows strictly after `after`, in primary-key order.
    async fn read_rows_batch(
        &self,
        plugin_id: &str,
        table: &str,
        batch_size: usize,
        after: Option<&RowCursor>,
    ) -> StorageResult<Vec<(RowCursor, Row)>>;

    /// Upsert without consuming rate-limit tokens. Size and count limits still apply.
    async fn migration_table_upsert(&self, plugin_id: &str, table: &str, row: &Row) -> StorageResult<Row>;
}
