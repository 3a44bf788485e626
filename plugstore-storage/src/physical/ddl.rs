//! Additive-only schema provisioning for physical tables.
//!
//! Tables are created from the declared DDL or upgraded by adding missing
//! columns and indexes. Any change that would drop or retype existing data
//! is rejected before a single statement runs.

use super::naming::{physical_index_name, physical_table_name};
use crate::catalog::PluginCatalog;
use crate::db::{quote_ident, table_columns, table_exists, table_indexes, StorageDb};
use crate::error::{StorageError, StorageResult};
use duckdb::Connection;
use plugstore_model::{PluginStorageConfig, StorageDdlTableSpec};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// What an install pass has to do for one declared table.
enum TablePlan {
    Create,
    Upgrade { add_columns: Vec<String> },
}

/// Provisions and upgrades the physical tables of physical-capable plugins.
pub struct SafeDdlEngine {
    db: StorageDb,
    catalog: PluginCatalog,
    install_lock: Mutex<()>,
}

impl SafeDdlEngine {
    pub fn new(db: StorageDb, catalog: PluginCatalog) -> Self {
        Self {
            db,
            catalog,
            install_lock: Mutex::new(()),
        }
    }

    /// Install every physical-mode plugin, in plugin id order.
    pub async fn install_all(&self) -> StorageResult<Vec<String>> {
        self.catalog.check_physical_names()?;
        let plugins = self.catalog.physical_plugins();
        for plugin_id in &plugins {
            self.install_or_upgrade(plugin_id).await?;
        }
        Ok(plugins)
    }

    /// Create or additively upgrade every declared table of `plugin_id`. Idempotent.
    pub async fn install_or_upgrade(&self, plugin_id: &str) -> StorageResult<()> {
        let config = self.catalog.config(plugin_id)?;
        if config.ddl.is_none() {
            return Err(StorageError::ddl(format!(
                "Plugin '{plugin_id}' is not configured for physical tables"
            )));
        }
        self.catalog.check_physical_names()?;
        let config = config.clone();
        let plugin = plugin_id.to_string();

        let _guard = self.install_lock.lock().await;
        self.db
            .run(move |conn| install_plugin(conn, &plugin, &config))
            .await
    }
}

fn install_plugin(conn: &mut Connection, plugin_id: &str, config: &PluginStorageConfig) -> StorageResult<()> {
    let Some(ddl) = config.ddl.as_ref() else {
        return Err(StorageError::ddl(format!("Plugin '{plugin_id}' DDL spec is missing")));
    };

    let declared: HashSet<&str> = config.tables.iter().map(|t| t.name.as_str()).collect();
    if declared.len() > config.limits.max_tables {
        return Err(StorageError::ddl(format!(
            "Plugin '{plugin_id}' table specs exceed max_tables limit ({}>{})",
            declared.len(),
            config.limits.max_tables
        )));
    }

    // Plan every table first so a rejected change leaves the schema untouched.
    let mut plans = Vec::new();
    for ddl_table in ddl.tables.iter().filter(|t| declared.contains(t.name.as_str())) {
        let physical = physical_table_name(plugin_id, &ddl_table.name)?;
        let plan = plan_table(conn, &physical, ddl_table)?;
        plans.push((physical, ddl_table, plan));
    }

    for (physical, ddl_table, plan) in plans {
        match plan {
            TablePlan::Create => create_table(conn, &physical, ddl_table)?,
            TablePlan::Upgrade { add_columns } if add_columns.is_empty() => {
                create_missing_indexes(conn, &physical, ddl_table)?;
            }
            TablePlan::Upgrade { add_columns } => {
                add_table_columns(conn, &physical, ddl_table, &add_columns)?;
            }
        }
    }
    Ok(())
}

fn plan_table(conn: &Connection, physical: &str, ddl_table: &StorageDdlTableSpec) -> StorageResult<TablePlan> {
    if !table_exists(conn, physical)? {
        return Ok(TablePlan::Create);
    }

    let existing = table_columns(conn, physical)?;
    let mut missing_from_spec: Vec<&str> = existing
        .iter()
        .filter(|(name, _)| ddl_table.column(name).is_none())
        .map(|(name, _)| name.as_str())
        .collect();
    if !missing_from_spec.is_empty() {
        missing_from_spec.sort_unstable();
        warn!(table = physical, columns = ?missing_from_spec, "Rejected destructive DDL change");
        return Err(StorageError::ddl(format!(
            "Destructive DDL change for table '{physical}' is not allowed; existing columns missing in spec: {}",
            missing_from_spec.join(", ")
        )));
    }

    for (name, data_type) in &existing {
        if let Some(column) = ddl_table.column(name) {
            let declared = column.column_type.sql_type();
            if !data_type.eq_ignore_ascii_case(declared) {
                return Err(StorageError::ddl(format!(
                    "Changing type of column '{name}' in table '{physical}' from {data_type} to {declared} is not allowed"
                )));
            }
        }
    }

    let existing_names: HashSet<&str> = existing.iter().map(|(name, _)| name.as_str()).collect();
    let mut add_columns = Vec::new();
    for column in &ddl_table.columns {
        if existing_names.contains(column.name.as_str()) {
            continue;
        }
        if column.name == ddl_table.primary_key {
            return Err(StorageError::ddl(format!(
                "Adding primary key column '{}' to existing table '{physical}' is not allowed",
                column.name
            )));
        }
        add_columns.push(column.name.clone());
    }
    Ok(TablePlan::Upgrade { add_columns })
}

fn create_table(conn: &Connection, physical: &str, ddl_table: &StorageDdlTableSpec) -> StorageResult<()> {
    let mut definitions: Vec<String> = ddl_table
        .columns
        .iter()
        .map(|column| {
            let not_null = if ddl_table.is_nullable(column) { "" } else { " NOT NULL" };
            format!("{} {}{not_null}", quote_ident(&column.name), column.column_type.sql_type())
        })
        .collect();
    definitions.push(format!("PRIMARY KEY ({})", quote_ident(&ddl_table.primary_key)));

    conn.execute_batch(&format!(
        "CREATE TABLE {} ({})",
        quote_ident(physical),
        definitions.join(", ")
    ))?;
    info!(table = physical, columns = ddl_table.columns.len(), "Physical table created");
    create_missing_indexes(conn, physical, ddl_table)
}

/// DuckDB refuses `ALTER TABLE` while secondary indexes depend on the table,
/// so managed indexes are dropped first and rebuilt afterwards.
fn add_table_columns(
    conn: &Connection,
    physical: &str,
    ddl_table: &StorageDdlTableSpec,
    add_columns: &[String],
) -> StorageResult<()> {
    for index in table_indexes(conn, physical)? {
        if index.starts_with("ix_") {
            conn.execute_batch(&format!("DROP INDEX IF EXISTS {}", quote_ident(&index)))?;
        }
    }

    for name in add_columns {
        let Some(column) = ddl_table.column(name) else {
            continue;
        };
        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(physical),
            quote_ident(&column.name),
            column.column_type.sql_type()
        ))?;
        info!(table = physical, column = %column.name, "Physical column added");
    }

    create_missing_indexes(conn, physical, ddl_table)
}

fn create_missing_indexes(conn: &Connection, physical: &str, ddl_table: &StorageDdlTableSpec) -> StorageResult<()> {
    let existing: HashSet<String> = table_indexes(conn, physical)?.into_iter().collect();
    for index in &ddl_table.indexes {
        let name = physical_index_name(physical, &index.name)?;
        if existing.contains(&name) {
            continue;
        }
        let columns: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
        let unique = if index.unique { "UNIQUE " } else { "" };
        conn.execute_batch(&format!(
            "CREATE {unique}INDEX {} ON {} ({})",
            quote_ident(&name),
            quote_ident(physical),
            columns.join(", ")
        ))?;
        info!(table = physical, index = %name, unique = index.unique, "Physical index created");
    }
    Ok(())
}
