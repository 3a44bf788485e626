//! Online migration of plugin tables between storage backends.

use crate::error::{MigrationError, MigrationResult};
use crate::events::{MigrationEvent, MigrationEventSink};
use crate::locks::MigrationLockManager;
use crate::request::{MigrationPlanEntry, MigrationReport, MigrationRequest, MigrationStatus, MigrationStrategy};
use plugstore_model::StorageMode;
use plugstore_storage::{RowCursor, StorageBackend, StorageModeRouter};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Copies tables from one backend to another and flips their routing.
///
/// Every requested table is read-only for the whole migration, and copying
/// starts only after writes admitted before the lock have landed. Rows are read
/// in primary-key order with a cursor and upserted into the destination, so
/// re-running an interrupted migration overwrites rather than duplicates.
pub struct StorageMigrationRunner {
    router: Arc<StorageModeRouter>,
    locks: Arc<MigrationLockManager>,
    events: Arc<dyn MigrationEventSink>,
}

impl StorageMigrationRunner {
    pub fn new(
        router: Arc<StorageModeRouter>,
        locks: Arc<MigrationLockManager>,
        events: Arc<dyn MigrationEventSink>,
    ) -> Self {
        Self { router, locks, events }
    }

    /// Validate, plan and (unless dry-run) execute `request`.
    ///
    /// Validation failures return before any event is published; any later
    /// failure publishes `migrate.failed` and leaves table modes unchanged for
    /// tables that were not yet switched.
    pub async fn run(&self, request: MigrationRequest) -> MigrationResult<MigrationReport> {
        let request = request.normalized()?;
        self.validate(&request)?;

        let migration_id = Uuid::now_v7();
        self.events
            .publish(MigrationEvent::Started {
                migration_id,
                plugin_id: request.plugin_id.clone(),
                from_mode: request.from_mode,
                to_mode: request.to_mode,
                tables: request.tables.clone(),
                dry_run: request.dry_run,
                strategy: request.strategy,
            })
            .await;

        match self.execute(migration_id, &request).await {
            Ok(report) => {
                info!(
                    %migration_id,
                    plugin_id = %report.plugin_id,
                    status = report.status.as_str(),
                    switched = report.switched_tables.len(),
                    "Storage migration finished"
                );
                self.events
                    .publish(MigrationEvent::Completed {
                        migration_id,
                        plugin_id: report.plugin_id.clone(),
                        from_mode: report.from_mode,
                        to_mode: report.to_mode,
                        tables: report.tables.clone(),
                        dry_run: report.dry_run,
                        strategy: report.strategy,
                        status: report.status,
                        copied_rows: report.copied_rows.clone(),
                        switched_tables: report.switched_tables.clone(),
                    })
                    .await;
                Ok(report)
            }
            Err(error) => {
                warn!(%migration_id, plugin_id = %request.plugin_id, code = error.code(), %error, "Storage migration failed");
                self.events
                    .publish(MigrationEvent::Failed {
                        migration_id,
                        plugin_id: request.plugin_id.clone(),
                        from_mode: request.from_mode,
                        to_mode: request.to_mode,
                        tables: request.tables.clone(),
                        error: error.failure_label(),
                    })
                    .await;
                Err(error)
            }
        }
    }

    fn validate(&self, request: &MigrationRequest) -> MigrationResult<()> {
        let plugin_id = request.plugin_id.as_str();
        let config = self.router.get_plugin_config(plugin_id)?;

        let mut invalid: Vec<&str> = request
            .tables
            .iter()
            .filter(|table| config.table(table).is_none())
            .map(String::as_str)
            .collect();
        if !invalid.is_empty() {
            invalid.sort_unstable();
            return Err(MigrationError::TableNotAllowed(format!(
                "Tables are not configured for plugin '{plugin_id}': {}",
                invalid.join(", ")
            )));
        }

        for table in &request.tables {
            let current = self.router.get_table_mode(plugin_id, table)?;
            if current != request.from_mode {
                return Err(MigrationError::ModeMismatch(format!(
                    "Table '{table}' for plugin '{plugin_id}' is in mode '{current}', expected '{}'",
                    request.from_mode
                )));
            }
        }

        if request.to_mode == StorageMode::Physical && config.ddl.is_none() {
            return Err(MigrationError::MissingDdl(format!(
                "Plugin '{plugin_id}' has no DDL spec for physical tables migration"
            )));
        }

        if request.strategy != MigrationStrategy::ReadOnlyLock {
            return Err(MigrationError::StrategyNotSupported(
                "Only strategy 'read_only_lock' is currently supported".into(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, migration_id: Uuid, request: &MigrationRequest) -> MigrationResult<MigrationReport> {
        let plugin_id = request.plugin_id.as_str();
        let source = self.router.backend(request.from_mode);

        let mut plan = Vec::with_capacity(request.tables.len());
        for table in &request.tables {
            let rows = source.count_table_rows(plugin_id, table).await?;
            plan.push(MigrationPlanEntry {
                table: table.clone(),
                rows,
            });
        }

        let mut report = MigrationReport {
            migration_id,
            plugin_id: plugin_id.to_string(),
            from_mode: request.from_mode,
            to_mode: request.to_mode,
            strategy: request.strategy,
            dry_run: request.dry_run,
            tables: request.tables.clone(),
            plan,
            copied_rows: BTreeMap::new(),
            switched_tables: Vec::new(),
            status: MigrationStatus::Planned,
        };
        if request.dry_run {
            return Ok(report);
        }

        let guard = self.locks.read_only_lock(plugin_id, &request.tables).await?;
        let destination = self.router.backend(request.to_mode);
        destination.prepare_plugin(plugin_id).await?;

        for table in &request.tables {
            let copied = self
                .copy_table(migration_id, plugin_id, table, source, destination, request.batch_size)
                .await?;
            self.router.set_table_mode(plugin_id, table, request.to_mode)?;
            report.copied_rows.insert(table.clone(), copied);
            report.switched_tables.push(table.clone());
        }
        drop(guard);

        report.status = MigrationStatus::Completed;
        Ok(report)
    }

    async fn copy_table(
        &self,
        migration_id: Uuid,
        plugin_id: &str,
        table: &str,
        source: &dyn StorageBackend,
        destination: &dyn StorageBackend,
        batch_size: usize,
    ) -> MigrationResult<u64> {
        let mut after: Option<RowCursor> = None;
        let mut copied = 0u64;

        loop {
            let batch = source
                .read_rows_batch(plugin_id, table, batch_size, after.as_ref())
                .await?;
            if batch.is_empty() {
                break;
            }
            for (cursor, row) in batch {
                destination.migration_table_upsert(plugin_id, table, &row).await?;
                copied += 1;
                after = Some(cursor);
            }
            debug!(%migration_id, plugin_id, table, copied, "Copied migration batch");
            self.events
                .publish(MigrationEvent::Progress {
                    migration_id,
                    plugin_id: plugin_id.to_string(),
                    table: table.to_string(),
                    copied,
                })
                .await;
        }
        Ok(copied)
    }
}
