//! Online migration of plugin tables between plugstore storage modes.
//!
//! # Architecture
//!
//! - [`MigrationLockManager`] holds reference-counted read-only locks and is
//!   the router's [`WriteLockProbe`](plugstore_storage::WriteLockProbe)
//! - [`StorageMigrationRunner`] plans, locks, copies in primary-key cursor
//!   batches, then flips each table's routing override
//! - Lifecycle events go to a [`MigrationEventSink`]

mod error;
mod events;
mod locks;
mod request;
mod runner;

pub use error::{MigrationError, MigrationResult};
pub use events::{
    MigrationEvent, MigrationEventSink, TracingEventSink, EVENT_MIGRATE_COMPLETED, EVENT_MIGRATE_FAILED,
    EVENT_MIGRATE_PROGRESS, EVENT_MIGRATE_STARTED,
};
pub use locks::{MigrationLockManager, ReadOnlyLockGuard};
pub use request::{
    MigrationPlanEntry, MigrationReport, MigrationRequest, MigrationStatus, MigrationStrategy, DEFAULT_BATCH_SIZE,
    MAX_BATCH_SIZE,
};
pub use runner::StorageMigrationRunner;
