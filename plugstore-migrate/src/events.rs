//! Lifecycle events published while a migration runs.

use crate::request::{MigrationStatus, MigrationStrategy};
use async_trait::async_trait;
use plugstore_model::StorageMode;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const EVENT_MIGRATE_STARTED: &str = "migrate.started";
pub const EVENT_MIGRATE_PROGRESS: &str = "migrate.progress";
pub const EVENT_MIGRATE_COMPLETED: &str = "migrate.completed";
pub const EVENT_MIGRATE_FAILED: &str = "migrate.failed";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum MigrationEvent {
    #[serde(rename = "migrate.started")]
    Started {
        migration_id: Uuid,
        plugin_id: String,
        from_mode: StorageMode,
        to_mode: StorageMode,
        tables: Vec<String>,
        dry_run: bool,
        strategy: MigrationStrategy,
    },
    /// Emitted after every copied batch; `copied` is cumulative for the table.
    #[serde(rename = "migrate.progress")]
    Progress {
        migration_id: Uuid,
        plugin_id: String,
        table: String,
        copied: u64,
    },
    #[serde(rename = "migrate.completed")]
    Completed {
        migration_id: Uuid,
        plugin_id: String,
        from_mode: StorageMode,
        to_mode: StorageMode,
        tables: Vec<String>,
        dry_run: bool,
        strategy: MigrationStrategy,
        status: MigrationStatus,
        copied_rows: BTreeMap<String, u64>,
        switched_tables: Vec<String>,
    },
    #[serde(rename = "migrate.failed")]
    Failed {
        migration_id: Uuid,
        plugin_id: String,
        from_mode: StorageMode,
        to_mode: StorageMode,
        tables: Vec<String>,
        error: String,
    },
}

impl MigrationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => EVENT_MIGRATE_STARTED,
            Self::Progress { .. } => EVENT_MIGRATE_PROGRESS,
            Self::Completed { .. } => EVENT_MIGRATE_COMPLETED,
            Self::Failed { .. } => EVENT_MIGRATE_FAILED,
        }
    }

    pub fn migration_id(&self) -> Uuid {
        match self {
            Self::Started { migration_id, .. }
            | Self::Progress { migration_id, .. }
            | Self::Completed { migration_id, .. }
            | Self::Failed { migration_id, .. } => *migration_id,
        }
    }
}

/// Receives migration events. Publishing never fails a migration.
#[async_trait]
pub trait MigrationEventSink: Send + Sync {
    async fn publish(&self, event: MigrationEvent);
}

/// Writes every event to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl MigrationEventSink for TracingEventSink {
    async fn publish(&self, event: MigrationEvent) {
        match &event {
            MigrationEvent::Started {
                migration_id,
                plugin_id,
                from_mode,
                to_mode,
                tables,
                dry_run,
                ..
            } => info!(%migration_id, plugin_id, %from_mode, %to_mode, ?tables, dry_run, "Migration started"),
            MigrationEvent::Progress {
                migration_id,
                plugin_id,
                table,
                copied,
            } => debug!(%migration_id, plugin_id, table, copied, "Migration progress"),
            MigrationEvent::Completed {
                migration_id,
                plugin_id,
                status,
                copied_rows,
                ..
            } => info!(%migration_id, plugin_id, status = status.as_str(), ?copied_rows, "Migration completed"),
            MigrationEvent::Failed {
                migration_id,
                plugin_id,
                error,
                ..
            } => warn!(%migration_id, plugin_id, error, "Migration failed"),
        }
    }
}

#[async_trait]
impl MigrationEventSink for mpsc::UnboundedSender<MigrationEvent> {
    async fn publish(&self, event: MigrationEvent) {
        if let Err(e) = self.send(event) {
            debug!(event = e.0.event_type(), "Migration event dropped, receiver closed");
        }
    }
}
