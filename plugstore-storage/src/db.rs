//! Shared DuckDB handle and generic-table schema.

use crate::error::{StorageError, StorageResult};
use duckdb::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// KV entries, shared by both backends.
const PLUGIN_KV_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS plugin_kv (
    plugin_id VARCHAR NOT NULL,
    key VARCHAR NOT NULL,
    value TEXT NOT NULL,
    is_secret BOOLEAN NOT NULL DEFAULT FALSE,
    value_bytes BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    PRIMARY KEY (plugin_id, key)
);
"#;

/// Universal-mode rows keyed by the canonical encoding of the primary key.
const PLUGIN_ROWS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS plugin_rows (
    plugin_id VARCHAR NOT NULL,
    table_name VARCHAR NOT NULL,
    pk VARCHAR NOT NULL,
    row_json TEXT NOT NULL,
    row_bytes BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    PRIMARY KEY (plugin_id, table_name, pk)
);
"#;

/// Universal-mode secondary index entries. Rewritten on every upsert, so the
/// table carries a lookup index only and no uniqueness constraint.
const PLUGIN_INDEXES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS plugin_indexes (
    plugin_id VARCHAR NOT NULL,
    table_name VARCHAR NOT NULL,
    index_name VARCHAR NOT NULL,
    index_value VARCHAR NOT NULL,
    pk VARCHAR NOT NULL,
    updated_at BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS plugin_indexes_lookup
    ON plugin_indexes (plugin_id, table_name, index_name, index_value);
"#;

/// Initialize the generic storage tables. Idempotent.
pub fn initialize_storage_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(PLUGIN_KV_DDL)?;
    conn.execute_batch(PLUGIN_ROWS_DDL)?;
    conn.execute_batch(PLUGIN_INDEXES_DDL)?;
    Ok(())
}

/// Open a DuckDB connection with stale WAL recovery and resource limits.
///
/// If the initial open fails and a `.wal` file exists alongside the database,
/// it is removed and the open is retried once.
pub fn open_duckdb_with_wal_recovery(
    path: &Path,
    memory_limit: &str,
    threads: u32,
) -> StorageResult<Connection> {
    let conn = match Connection::open(path) {
        Ok(c) => c,
        Err(first_err) => {
            let wal_path = path.with_extension(
                path.extension()
                    .map(|ext| format!("{}.wal", ext.to_string_lossy()))
                    .unwrap_or_else(|| "wal".to_string()),
            );
            if !wal_path.exists() {
                return Err(first_err.into());
            }
            warn!(wal = %wal_path.display(), error = %first_err, "DuckDB open failed, removing stale WAL and retrying");
            std::fs::remove_file(&wal_path)?;
            Connection::open(path)?
        }
    };
    apply_resource_limits(&conn, memory_limit, threads)?;
    Ok(conn)
}

fn apply_resource_limits(conn: &Connection, memory_limit: &str, threads: u32) -> StorageResult<()> {
    let memory_limit = memory_limit.replace('\'', "");
    conn.execute_batch(&format!(
        "PRAGMA memory_limit='{memory_limit}'; PRAGMA threads={threads};"
    ))?;
    Ok(())
}

/// Thread-safe handle to the storage database, cheap to clone.
///
/// All database work runs on the blocking pool through [`StorageDb::run`];
/// the connection lock is never held across an `.await`.
#[derive(Clone)]
pub struct StorageDb {
    conn: Arc<Mutex<Connection>>,
}

impl StorageDb {
    /// Open (or create) the storage database at the given path.
    pub fn open(path: &Path, memory_limit: &str, threads: u32) -> StorageResult<Self> {
        let conn = open_duckdb_with_wal_recovery(path, memory_limit, threads)?;
        initialize_storage_schema(&conn)?;
        debug!(path = %path.display(), "Storage database opened");
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory storage database (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_storage_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Acquire the connection lock, recovering from poison if a prior
    /// holder panicked.
    pub fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("Storage connection mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn run<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock_conn();
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Internal(format!("storage task failed: {e}")))?
    }

    /// Flush the WAL into the database file.
    pub fn checkpoint(&self) -> StorageResult<()> {
        self.lock_conn().execute_batch("CHECKPOINT")?;
        Ok(())
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Introspect `(name, data_type)` of an existing table's columns, in declaration order.
pub(crate) fn table_columns(conn: &Connection, table: &str) -> StorageResult<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT column_name, data_type FROM information_schema.columns WHERE table_name = ? ORDER BY ordinal_position",
    )?;
    let columns = stmt
        .query_map(params![table], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> StorageResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn table_indexes(conn: &Connection, table: &str) -> StorageResult<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT index_name FROM duckdb_indexes() WHERE table_name = ? ORDER BY index_name")?;
    let indexes = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(indexes)
}

/// Double-quote an identifier for DuckDB.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
