//! Physical mode: one typed DuckDB table per (plugin, logical table).
//!
//! # Architecture
//!
//! - [`SafeDdlEngine`] provisions tables lazily on first use per plugin, or
//!   eagerly through [`PhysicalStorage::install_all`]
//! - Payload values are validated and converted per declared column type
//! - Query semantics match universal mode so tables can migrate between modes
//! - KV entries live in the shared `plugin_kv` table

mod codec;
mod ddl;
mod naming;

pub use ddl::SafeDdlEngine;
pub use naming::{physical_index_name, physical_table_name, sanitize_identifier};

use crate::backend::{PluginStorage, RowCursor, StorageBackend};
use crate::catalog::PluginCatalog;
use crate::db::{quote_ident, StorageDb};
use crate::error::{StorageError, StorageResult};
use crate::kv::KvStore;
use crate::quota::QuotaGuard;
use async_trait::async_trait;
use codec::{decode_column, encode_value, placeholder, select_expr, Encoded};
use duckdb::{params, Connection, ToSql};
use plugstore_model::{is_scalar, Row, StorageDdlColumnSpec, StorageLimits, StorageMode, StorageOp};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Resolved layout of one physical table.
#[derive(Debug)]
struct PhysicalTable {
    name: String,
    quoted: String,
    primary_key: String,
    indexes: Vec<String>,
    columns: Vec<StorageDdlColumnSpec>,
}

impl PhysicalTable {
    fn column(&self, name: &str) -> Option<&StorageDdlColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn pk_column(&self) -> StorageResult<&StorageDdlColumnSpec> {
        self.column(&self.primary_key).ok_or_else(|| {
            StorageError::Internal(format!("Primary key column missing from '{}'", self.name))
        })
    }

    fn is_nullable(&self, column: &StorageDdlColumnSpec) -> bool {
        column.name != self.primary_key && column.nullable
    }

    fn is_queryable(&self, field: &str) -> bool {
        field == self.primary_key || self.indexes.iter().any(|f| f == field)
    }

    fn select_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| select_expr(c, &quote_ident(&c.name)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn predicate(&self, column: &StorageDdlColumnSpec, op: &str) -> String {
        format!("{} {op} {}", quote_ident(&column.name), placeholder(column.column_type))
    }

    fn read_row(&self, row: &duckdb::Row<'_>) -> duckdb::Result<Row> {
        let mut decoded = Row::new();
        for (idx, column) in self.columns.iter().enumerate() {
            decoded.insert(column.name.clone(), decode_column(row, idx, column)?);
        }
        Ok(decoded)
    }

    fn encode_pk(&self, pk: &Value) -> StorageResult<Encoded> {
        if pk.is_null() || !is_scalar(pk) {
            return Err(StorageError::not_allowed("Primary key must be a non-null scalar value"));
        }
        encode_value(self.pk_column()?, false, pk, true)
    }

    /// Validate a payload against the declared columns.
    ///
    /// Returns the provided columns in declaration order plus the full
    /// read-back row (absent columns as null).
    fn normalize_payload(&self, payload: &Row) -> StorageResult<(Vec<(String, Encoded)>, Row)> {
        if let Some(unknown) = payload.keys().find(|field| self.column(field).is_none()) {
            return Err(StorageError::not_allowed(format!(
                "Field '{unknown}' is not declared in DDL table '{}'",
                self.name
            )));
        }

        let mut provided = Vec::with_capacity(payload.len());
        let mut decoded = Row::new();
        for column in &self.columns {
            match payload.get(&column.name) {
                Some(value) => {
                    let encoded = encode_value(column, self.is_nullable(column), value, false)?;
                    decoded.insert(column.name.clone(), encoded.json.clone());
                    provided.push((column.name.clone(), encoded));
                }
                None if !self.is_nullable(column) => {
                    return Err(StorageError::not_allowed(format!(
                        "Field '{}' is required by DDL table '{}'",
                        column.name, self.name
                    )));
                }
                None => {
                    decoded.insert(column.name.clone(), Value::Null);
                }
            }
        }
        Ok((provided, decoded))
    }
}

struct PreparedWrite {
    table: Arc<PhysicalTable>,
    pk: Encoded,
    provided: Vec<(String, Encoded)>,
    max_rows_per_table: u64,
}

fn write_row(conn: &mut Connection, w: &PreparedWrite) -> StorageResult<()> {
    let table = &w.table;
    let pk_column = table.pk_column()?;
    let tx = conn.transaction()?;

    let exists: bool = tx.query_row(
        &format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE {})",
            table.quoted,
            table.predicate(pk_column, "=")
        ),
        params![w.pk.sql],
        |row| row.get(0),
    )?;

    if !exists {
        let rows: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM {}", table.quoted), [], |row| {
            row.get(0)
        })?;
        if rows as u64 >= w.max_rows_per_table {
            return Err(StorageError::limit(format!(
                "Rows per table exceeded for '{}' ({rows}>={})",
                table.name, w.max_rows_per_table
            )));
        }

        let mut names = Vec::with_capacity(w.provided.len());
        let mut placeholders = Vec::with_capacity(w.provided.len());
        let mut param_refs: Vec<&dyn ToSql> = Vec::with_capacity(w.provided.len());
        for (name, encoded) in &w.provided {
            let Some(column) = table.column(name) else { continue };
            names.push(quote_ident(name));
            placeholders.push(placeholder(column.column_type));
            param_refs.push(&encoded.sql);
        }
        tx.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table.quoted,
                names.join(", "),
                placeholders.join(", ")
            ),
            param_refs.as_slice(),
        )?;
    } else {
        // The primary key itself is never rewritten.
        let mut assignments = Vec::new();
        let mut param_refs: Vec<&dyn ToSql> = Vec::new();
        for (name, encoded) in w.provided.iter().filter(|(name, _)| *name != table.primary_key) {
            let Some(column) = table.column(name) else { continue };
            assignments.push(table.predicate(column, "="));
            param_refs.push(&encoded.sql);
        }
        if !assignments.is_empty() {
            param_refs.push(&w.pk.sql);
            tx.execute(
                &format!(
                    "UPDATE {} SET {} WHERE {}",
                    table.quoted,
                    assignments.join(", "),
                    table.predicate(pk_column, "=")
                ),
                param_refs.as_slice(),
            )?;
        }
    }

    tx.commit()?;
    Ok(())
}

/// Typed per-plugin tables, provisioned on demand.
pub struct PhysicalStorage {
    db: StorageDb,
    catalog: PluginCatalog,
    quota: Arc<QuotaGuard>,
    kv: KvStore,
    ddl: SafeDdlEngine,
    ready: Mutex<HashSet<String>>,
    tables: Mutex<HashMap<(String, String), Arc<PhysicalTable>>>,
}

impl PhysicalStorage {
    pub fn new(db: StorageDb, catalog: PluginCatalog, quota: Arc<QuotaGuard>) -> Self {
        let kv = KvStore::new(db.clone(), catalog.clone(), Arc::clone(&quota));
        let ddl = SafeDdlEngine::new(db.clone(), catalog.clone());
        Self {
            db,
            catalog,
            quota,
            kv,
            ddl,
            ready: Mutex::new(HashSet::new()),
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn ddl_engine(&self) -> &SafeDdlEngine {
        &self.ddl
    }

    /// Provision every physical-mode plugin up front.
    pub async fn install_all(&self) -> StorageResult<()> {
        let installed = self.ddl.install_all().await?;
        let mut ready = self.ready.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ready.extend(installed);
        Ok(())
    }

    /// Provision `plugin_id`'s tables once per process.
    pub async fn ensure_plugin_ready(&self, plugin_id: &str) -> StorageResult<()> {
        self.catalog.config(plugin_id)?;
        if self.is_ready(plugin_id) {
            return Ok(());
        }
        self.ddl.install_or_upgrade(plugin_id).await?;
        self.ready
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(plugin_id.to_string());
        debug!(plugin_id, "Physical plugin ready");
        Ok(())
    }

    fn is_ready(&self, plugin_id: &str) -> bool {
        self.ready
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(plugin_id)
    }

    fn rate_limit(&self, plugin_id: &str, op: StorageOp) -> StorageResult<&StorageLimits> {
        let limits = self.catalog.limits(plugin_id)?;
        self.quota.consume(plugin_id, op, limits)?;
        Ok(limits)
    }

    async fn resolve_table(&self, plugin_id: &str, table: &str) -> StorageResult<Arc<PhysicalTable>> {
        let spec = self.catalog.table(plugin_id, table)?;
        let ddl_table = self.catalog.ddl_table(plugin_id, table)?;
        self.ensure_plugin_ready(plugin_id).await?;

        let key = (plugin_id.to_string(), table.to_string());
        let mut cache = self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(resolved) = cache.get(&key) {
            return Ok(Arc::clone(resolved));
        }
        let name = physical_table_name(plugin_id, table)?;
        let resolved = Arc::new(PhysicalTable {
            quoted: quote_ident(&name),
            name,
            primary_key: spec.primary_key.clone(),
            indexes: spec.indexes.clone(),
            columns: ddl_table.columns.clone(),
        });
        cache.insert(key, Arc::clone(&resolved));
        Ok(resolved)
    }

    async fn upsert_impl(&self, plugin_id: &str, table: &str, row: &Row) -> StorageResult<Row> {
        let limits = self.catalog.limits(plugin_id)?;
        let resolved = self.resolve_table(plugin_id, table).await?;
        let (provided, decoded) = resolved.normalize_payload(row)?;

        let pk_value = row.get(&resolved.primary_key).ok_or_else(|| {
            StorageError::not_allowed(format!(
                "Table '{table}' row must include primary key field '{}'",
                resolved.primary_key
            ))
        })?;
        let pk = resolved.encode_pk(pk_value)?;
        QuotaGuard::enforce_row_bytes(&Value::Object(decoded.clone()), limits)?;

        let write = PreparedWrite {
            table: resolved,
            pk,
            provided,
            max_rows_per_table: limits.max_rows_per_table,
        };
        self.db.run(move |conn| write_row(conn, &write)).await?;
        Ok(decoded)
    }
}

#[async_trait]
impl PluginStorage for PhysicalStorage {
    async fn kv_get(&self, plugin_id: &str, key: &str, secret: bool) -> StorageResult<Option<Value>> {
        self.kv.get(plugin_id, key, secret).await
    }

    async fn kv_set(&self, plugin_id: &str, key: &str, value: &Value, secret: bool) -> StorageResult<()> {
        self.kv.set(plugin_id, key, value, secret).await
    }

    async fn kv_delete(&self, plugin_id: &str, key: &str) -> StorageResult<bool> {
        self.kv.delete(plugin_id, key).await
    }

    async fn table_get(&self, plugin_id: &str, table: &str, pk: &Value) -> StorageResult<Option<Row>> {
        self.rate_limit(plugin_id, StorageOp::TableGet)?;
        let resolved = self.resolve_table(plugin_id, table).await?;
        let pk = resolved.encode_pk(pk)?;

        self.db
            .run(move |conn| {
                let sql = format!(
                    "SELECT {} FROM {} WHERE {} LIMIT 1",
                    resolved.select_list(),
                    resolved.quoted,
                    resolved.predicate(resolved.pk_column()?, "=")
                );
                match conn.query_row(&sql, params![pk.sql], |row| resolved.read_row(row)) {
                    Ok(row) => Ok(Some(row)),
                    Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    async fn table_upsert(&self, plugin_id: &str, table: &str, row: &Row) -> StorageResult<Row> {
        self.rate_limit(plugin_id, StorageOp::TableUpsert)?;
        self.upsert_impl(plugin_id, table, row).await
    }

    async fn table_delete(&self, plugin_id: &str, table: &str, pk: &Value) -> StorageResult<bool> {
        self.rate_limit(plugin_id, StorageOp::TableDelete)?;
        let resolved = self.resolve_table(plugin_id, table).await?;
        let pk = resolved.encode_pk(pk)?;

        self.db
            .run(move |conn| {
                let sql = format!(
                    "DELETE FROM {} WHERE {}",
                    resolved.quoted,
                    resolved.predicate(resolved.pk_column()?, "=")
                );
                let deleted = conn.execute(&sql, params![pk.sql])?;
                Ok(deleted > 0)
            })
            .await
    }

    async fn table_query(
        &self,
        plugin_id: &str,
        table: &str,
        predicates: &Row,
        limit: Option<u32>,
    ) -> StorageResult<Vec<Row>> {
        let limits = self.rate_limit(plugin_id, StorageOp::TableQuery)?;
        let resolved = self.resolve_table(plugin_id, table).await?;
        if predicates.is_empty() {
            return Err(StorageError::not_allowed("table_query requires non-empty where"));
        }

        let mut conditions = Vec::with_capacity(predicates.len());
        let mut params = Vec::with_capacity(predicates.len());
        let mut matches_nothing = false;
        for (field, value) in predicates {
            if !resolved.is_queryable(field) {
                return Err(StorageError::not_allowed(format!(
                    "Field '{field}' is not queryable for table '{table}'"
                )));
            }
            if !is_scalar(value) {
                return Err(StorageError::not_allowed(
                    "table_query supports equality AND on scalar values only",
                ));
            }
            let column = resolved.column(field).ok_or_else(|| {
                StorageError::not_allowed(format!("Field '{field}' is missing in DDL for table '{table}'"))
            })?;
            if *field == resolved.primary_key {
                resolved.encode_pk(value)?;
            } else if value.is_null() {
                // Null never matches an index entry in universal mode either.
                matches_nothing = true;
                continue;
            }
            conditions.push(resolved.predicate(column, "="));
            params.push(encode_value(column, true, value, true)?.sql);
        }
        if matches_nothing {
            return Ok(Vec::new());
        }
        let limit = i64::from(QuotaGuard::effective_query_limit(limit, limits));

        self.db
            .run(move |conn| {
                let sql = format!(
                    "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT ?",
                    resolved.select_list(),
                    resolved.quoted,
                    conditions.join(" AND "),
                    quote_ident(&resolved.primary_key)
                );
                let mut param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
                param_refs.push(&limit);

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(param_refs.as_slice(), |row| resolved.read_row(row))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

#[async_trait]
impl StorageBackend for PhysicalStorage {
    fn mode(&self) -> StorageMode {
        StorageMode::Physical
    }

    async fn prepare_plugin(&self, plugin_id: &str) -> StorageResult<()> {
        self.ensure_plugin_ready(plugin_id).await
    }

    async fn count_table_rows(&self, plugin_id: &str, table: &str) -> StorageResult<u64> {
        let resolved = self.resolve_table(plugin_id, table).await?;
        self.db
            .run(move |conn| {
                let count: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {}", resolved.quoted), [], |row| {
                        row.get(0)
                    })?;
                Ok(count as u64)
            })
            .await
    }

    async fn read_rows_batch(
        &self,
        plugin_id: &str,
        table: &str,
        batch_size: usize,
        after: Option<&RowCursor>,
    ) -> StorageResult<Vec<(RowCursor, Row)>> {
        let resolved = self.resolve_table(plugin_id, table).await?;
        let after = after.map(|pk| resolved.encode_pk(pk)).transpose()?;
        let limit = batch_size.max(1) as i64;

        let rows = self
            .db
            .run(move |conn| {
                let pk_column = resolved.pk_column()?;
                let filter = match after {
                    Some(_) => format!(" WHERE {}", resolved.predicate(pk_column, ">")),
                    None => String::new(),
                };
                let sql = format!(
                    "SELECT {} FROM {}{filter} ORDER BY {} LIMIT ?",
                    resolved.select_list(),
                    resolved.quoted,
                    quote_ident(&resolved.primary_key)
                );
                let mut param_refs: Vec<&dyn ToSql> = Vec::with_capacity(2);
                if let Some(after) = after.as_ref() {
                    param_refs.push(&after.sql);
                }
                param_refs.push(&limit);

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(param_refs.as_slice(), |row| resolved.read_row(row))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows
                    .into_iter()
                    .map(|row| {
                        let pk = row.get(&resolved.primary_key).cloned().unwrap_or(Value::Null);
                        (pk, row)
                    })
                    .collect::<Vec<_>>())
            })
            .await?;
        debug!(plugin_id, table, rows = rows.len(), "Read physical batch");
        Ok(rows)
    }

    async fn migration_table_upsert(&self, plugin_id: &str, table: &str, row: &Row) -> StorageResult<Row> {
        self.upsert_impl(plugin_id, table, row).await
    }
}
