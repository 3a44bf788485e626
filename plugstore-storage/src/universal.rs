//! Universal mode: arbitrary JSON rows for any plugin table in shared generic
//! tables, with secondary index entries maintained on every write.

use crate::backend::{PluginStorage, RowCursor, StorageBackend};
use crate::catalog::PluginCatalog;
use crate::db::{now_millis, StorageDb};
use crate::error::{StorageError, StorageResult};
use crate::kv::KvStore;
use crate::quota::QuotaGuard;
use async_trait::async_trait;
use duckdb::{params, Connection, ToSql};
use plugstore_model::{canonical_json, is_scalar, Row, StorageLimits, StorageMode, StorageOp};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Canonical string key of a primary-key value.
pub(crate) fn encode_pk(value: &Value) -> StorageResult<String> {
    if value.is_null() || !is_scalar(value) {
        return Err(StorageError::not_allowed("Primary key must be a non-null scalar value"));
    }
    Ok(canonical_json(value)?)
}

fn encode_index_value(value: &Value) -> StorageResult<String> {
    if !is_scalar(value) {
        return Err(StorageError::not_allowed(
            "Indexed fields support only scalar equality values",
        ));
    }
    Ok(canonical_json(value)?)
}

fn decode_row(row_json: &str) -> StorageResult<Row> {
    match serde_json::from_str::<Value>(row_json)? {
        Value::Object(row) => Ok(row),
        _ => Err(StorageError::Internal("Stored row payload is invalid".into())),
    }
}

/// Everything the write transaction needs, resolved before touching the db.
struct PreparedUpsert {
    plugin_id: String,
    table: String,
    pk: String,
    row_json: String,
    row_bytes: usize,
    index_entries: Vec<(String, String)>,
    max_tables: usize,
    max_rows_per_table: u64,
}

/// Generic key/row storage shared by all universal-mode plugins.
#[derive(Clone)]
pub struct UniversalStorage {
    db: StorageDb,
    catalog: PluginCatalog,
    quota: Arc<QuotaGuard>,
    kv: KvStore,
}

impl UniversalStorage {
    pub fn new(db: StorageDb, catalog: PluginCatalog, quota: Arc<QuotaGuard>) -> Self {
        let kv = KvStore::new(db.clone(), catalog.clone(), Arc::clone(&quota));
        Self {
            db,
            catalog,
            quota,
            kv,
        }
    }

    fn rate_limit(&self, plugin_id: &str, op: StorageOp) -> StorageResult<&StorageLimits> {
        let limits = self.catalog.limits(plugin_id)?;
        self.quota.consume(plugin_id, op, limits)?;
        Ok(limits)
    }

    fn prepare_upsert(&self, plugin_id: &str, table: &str, row: &Row) -> StorageResult<PreparedUpsert> {
        let limits = self.catalog.limits(plugin_id)?;
        let spec = self.catalog.table(plugin_id, table)?;

        let pk_value = row.get(&spec.primary_key).ok_or_else(|| {
            StorageError::not_allowed(format!(
                "Table '{table}' row must include primary key field '{}'",
                spec.primary_key
            ))
        })?;
        let pk = encode_pk(pk_value)?;
        let (row_json, row_bytes) = QuotaGuard::enforce_row_bytes(&Value::Object(row.clone()), limits)?;

        let mut index_entries = Vec::with_capacity(spec.indexes.len());
        for field in &spec.indexes {
            match row.get(field) {
                None | Some(Value::Null) => continue,
                Some(value) => index_entries.push((field.clone(), encode_index_value(value)?)),
            }
        }

        Ok(PreparedUpsert {
            plugin_id: plugin_id.to_string(),
            table: table.to_string(),
            pk,
            row_json,
            row_bytes,
            index_entries,
            max_tables: limits.max_tables,
            max_rows_per_table: limits.max_rows_per_table,
        })
    }

    async fn upsert_impl(&self, plugin_id: &str, table: &str, row: &Row) -> StorageResult<Row> {
        let prepared = self.prepare_upsert(plugin_id, table, row)?;
        self.db.run(move |conn| write_row(conn, &prepared)).await?;
        Ok(row.clone())
    }
}

fn write_row(conn: &mut Connection, p: &PreparedUpsert) -> StorageResult<()> {
    let tx = conn.transaction()?;
    let now = now_millis();

    let table_known: bool = tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM plugin_rows WHERE plugin_id = ? AND table_name = ?)",
        params![p.plugin_id, p.table],
        |row| row.get(0),
    )?;
    if !table_known {
        let table_count: i64 = tx.query_row(
            "SELECT COUNT(DISTINCT table_name) FROM plugin_rows WHERE plugin_id = ?",
            params![p.plugin_id],
            |row| row.get(0),
        )?;
        if table_count as usize >= p.max_tables {
            return Err(StorageError::limit(format!(
                "Table count exceeded for plugin '{}' ({table_count}>={})",
                p.plugin_id, p.max_tables
            )));
        }
    }

    let exists: bool = tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM plugin_rows WHERE plugin_id = ? AND table_name = ? AND pk = ?)",
        params![p.plugin_id, p.table, p.pk],
        |row| row.get(0),
    )?;

    if exists {
        tx.execute(
            "UPDATE plugin_rows SET row_json = ?, row_bytes = ?, updated_at = ? WHERE plugin_id = ? AND table_name = ? AND pk = ?",
            params![p.row_json, p.row_bytes as i64, now, p.plugin_id, p.table, p.pk],
        )?;
    } else {
        let rows: i64 = tx.query_row(
            "SELECT COUNT(*) FROM plugin_rows WHERE plugin_id = ? AND table_name = ?",
            params![p.plugin_id, p.table],
            |row| row.get(0),
        )?;
        if rows as u64 >= p.max_rows_per_table {
            return Err(StorageError::limit(format!(
                "Rows per table exceeded for '{}' ({rows}>={})",
                p.table, p.max_rows_per_table
            )));
        }
        tx.execute(
            "INSERT INTO plugin_rows (plugin_id, table_name, pk, row_json, row_bytes, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
            params![p.plugin_id, p.table, p.pk, p.row_json, p.row_bytes as i64, now],
        )?;
    }

    tx.execute(
        "DELETE FROM plugin_indexes WHERE plugin_id = ? AND table_name = ? AND pk = ?",
        params![p.plugin_id, p.table, p.pk],
    )?;
    for (field, value) in &p.index_entries {
        tx.execute(
            "INSERT INTO plugin_indexes (plugin_id, table_name, index_name, index_value, pk, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
            params![p.plugin_id, p.table, field, value, p.pk, now],
        )?;
    }

    tx.commit()?;
    Ok(())
}

fn index_candidates(
    conn: &Connection,
    plugin_id: &str,
    table: &str,
    field: &str,
    value: &str,
) -> StorageResult<BTreeSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT pk FROM plugin_indexes WHERE plugin_id = ? AND table_name = ? AND index_name = ? AND index_value = ?",
    )?;
    let pks = stmt
        .query_map(params![plugin_id, table, field, value], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(pks)
}

enum Predicate {
    Pk(String),
    Index(String, String),
}

#[async_trait]
impl PluginStorage for UniversalStorage {
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
        self.catalog.table(plugin_id, table)?;
        let pk = encode_pk(pk)?;

        let (plugin, table) = (plugin_id.to_string(), table.to_string());
        let stored = self
            .db
            .run(move |conn| {
                let result = conn.query_row(
                    "SELECT row_json FROM plugin_rows WHERE plugin_id = ? AND table_name = ? AND pk = ?",
                    params![plugin, table, pk],
                    |row| row.get::<_, String>(0),
                );
                match result {
                    Ok(json) => Ok(Some(json)),
                    Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        stored.as_deref().map(decode_row).transpose()
    }

    async fn table_upsert(&self, plugin_id: &str, table: &str, row: &Row) -> StorageResult<Row> {
        self.rate_limit(plugin_id, StorageOp::TableUpsert)?;
        self.upsert_impl(plugin_id, table, row).await
    }

    async fn table_delete(&self, plugin_id: &str, table: &str, pk: &Value) -> StorageResult<bool> {
        self.rate_limit(plugin_id, StorageOp::TableDelete)?;
        self.catalog.table(plugin_id, table)?;
        let pk = encode_pk(pk)?;

        let (plugin, table) = (plugin_id.to_string(), table.to_string());
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                let deleted = tx.execute(
                    "DELETE FROM plugin_rows WHERE plugin_id = ? AND table_name = ? AND pk = ?",
                    params![plugin, table, pk],
                )?;
                if deleted > 0 {
                    tx.execute(
                        "DELETE FROM plugin_indexes WHERE plugin_id = ? AND table_name = ? AND pk = ?",
                        params![plugin, table, pk],
                    )?;
                }
                tx.commit()?;
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
        let spec = self.catalog.table(plugin_id, table)?;
        if predicates.is_empty() {
            return Err(StorageError::not_allowed("table_query requires non-empty where"));
        }

        let mut resolved = Vec::with_capacity(predicates.len());
        for (field, value) in predicates {
            if !spec.is_queryable(field) {
                return Err(StorageError::not_allowed(format!(
                    "Field '{field}' is not queryable for table '{table}'"
                )));
            }
            if !is_scalar(value) {
                return Err(StorageError::not_allowed(
                    "table_query supports equality AND on scalar values only",
                ));
            }
            if *field == spec.primary_key {
                resolved.push(Predicate::Pk(encode_pk(value)?));
            } else {
                resolved.push(Predicate::Index(field.clone(), encode_index_value(value)?));
            }
        }
        let limit = QuotaGuard::effective_query_limit(limit, limits);

        let (plugin, table) = (plugin_id.to_string(), table.to_string());
        let stored = self
            .db
            .run(move |conn| {
                let mut candidates: Option<BTreeSet<String>> = None;
                for predicate in &resolved {
                    let matched = match predicate {
                        Predicate::Pk(pk) => BTreeSet::from([pk.clone()]),
                        Predicate::Index(field, value) => {
                            index_candidates(conn, &plugin, &table, field, value)?
                        }
                    };
                    candidates = Some(match candidates {
                        None => matched,
                        Some(current) => current.intersection(&matched).cloned().collect(),
                    });
                }
                let pks: Vec<String> = candidates.unwrap_or_default().into_iter().collect();
                if pks.is_empty() {
                    return Ok(Vec::new());
                }

                let placeholders = vec!["?"; pks.len()].join(", ");
                let sql = format!(
                    "SELECT row_json FROM plugin_rows WHERE plugin_id = ? AND table_name = ? AND pk IN ({placeholders}) ORDER BY pk LIMIT ?"
                );
                let limit = i64::from(limit);
                let mut param_refs: Vec<&dyn ToSql> = vec![&plugin as &dyn ToSql, &table as &dyn ToSql];
                param_refs.extend(pks.iter().map(|pk| pk as &dyn ToSql));
                param_refs.push(&limit);

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(param_refs.as_slice(), |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        stored.iter().map(|json| decode_row(json)).collect()
    }
}

#[async_trait]
impl StorageBackend for UniversalStorage {
    fn mode(&self) -> StorageMode {
        StorageMode::Universal
    }

    async fn prepare_plugin(&self, plugin_id: &str) -> StorageResult<()> {
        self.catalog.config(plugin_id).map(|_| ())
    }

    async fn count_table_rows(&self, plugin_id: &str, table: &str) -> StorageResult<u64> {
        self.catalog.table(plugin_id, table)?;
        let (plugin, table) = (plugin_id.to_string(), table.to_string());
        self.db
            .run(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM plugin_rows WHERE plugin_id = ? AND table_name = ?",
                    params![plugin, table],
                    |row| row.get(0),
                )?;
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
        self.catalog.table(plugin_id, table)?;
        let after = match after {
            None => None,
            Some(Value::String(pk)) => Some(pk.clone()),
            Some(other) => {
                return Err(StorageError::Internal(format!(
                    "Universal cursor must be an encoded primary key, got {other}"
                )));
            }
        };
        let limit = batch_size.max(1) as i64;

        let (plugin, table_name) = (plugin_id.to_string(), table.to_string());
        let stored = self
            .db
            .run(move |conn| {
                let mut sql = String::from(
                    "SELECT pk, row_json FROM plugin_rows WHERE plugin_id = ? AND table_name = ?",
                );
                let mut param_refs: Vec<&dyn ToSql> = vec![&plugin as &dyn ToSql, &table_name as &dyn ToSql];
                if let Some(after) = after.as_ref() {
                    sql.push_str(" AND pk > ?");
                    param_refs.push(after);
                }
                sql.push_str(" ORDER BY pk LIMIT ?");
                param_refs.push(&limit);

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(param_refs.as_slice(), |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        debug!(plugin_id, table, rows = stored.len(), "Read universal batch");
        stored
            .into_iter()
            .map(|(pk, json)| Ok((Value::String(pk), decode_row(&json)?)))
            .collect()
    }

    async fn migration_table_upsert(&self, plugin_id: &str, table: &str, row: &Row) -> StorageResult<Row> {
        self.upsert_impl(plugin_id, table, row).await
    }
}
