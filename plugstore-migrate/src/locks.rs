//! Reference-counted read-only locks on (plugin, table) pairs.

use crate::error::{MigrationError, MigrationResult};
use plugstore_storage::{WriteLockProbe, WritePermit};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

type LockKey = (String, String);

#[derive(Debug, Default)]
struct TableState {
    read_only: usize,
    writers: usize,
}

#[derive(Debug, Default)]
struct LockTable {
    tables: Mutex<HashMap<LockKey, TableState>>,
    writers_done: Notify,
}

impl LockTable {
    fn lock_tables(&self) -> MutexGuard<'_, HashMap<LockKey, TableState>> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_flight(&self, keys: &[LockKey]) -> usize {
        let tables = self.lock_tables();
        keys.iter().filter_map(|key| tables.get(key)).map(|state| state.writers).sum()
    }

    fn end_write(&self, key: &LockKey) {
        let drained = {
            let mut tables = self.lock_tables();
            let Some(state) = tables.get_mut(key) else {
                return;
            };
            state.writers = state.writers.saturating_sub(1);
            let drained = state.writers == 0;
            if drained && state.read_only == 0 {
                tables.remove(key);
            }
            drained
        };
        if drained {
            self.writers_done.notify_waiters();
        }
    }

    fn release(&self, keys: &[LockKey]) {
        let mut tables = self.lock_tables();
        for key in keys {
            let Some(state) = tables.get_mut(key) else {
                continue;
            };
            state.read_only = state.read_only.saturating_sub(1);
            if state.read_only == 0 && state.writers == 0 {
                tables.remove(key);
            }
        }
    }
}

/// Tracks which tables are read-only because a migration is copying them,
/// and which writes are still running against them.
///
/// Locks stack: overlapping acquisitions bump a count, and a table stays
/// locked until every holder has released it.
#[derive(Debug, Default)]
pub struct MigrationLockManager {
    state: Arc<LockTable>,
}

impl MigrationLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every table in `tables` at once and wait for writes admitted
    /// before the lock to finish. The returned guard releases the tables on
    /// drop, including when this future is dropped while waiting.
    pub async fn read_only_lock(&self, plugin_id: &str, tables: &[String]) -> MigrationResult<ReadOnlyLockGuard> {
        let normalized: BTreeSet<&str> = tables.iter().map(|t| t.trim()).filter(|t| !t.is_empty()).collect();
        if normalized.is_empty() {
            return Err(MigrationError::InvalidRequest(
                "Migration lock requires at least one table".into(),
            ));
        }

        let keys: Vec<LockKey> = normalized
            .into_iter()
            .map(|table| (plugin_id.to_string(), table.to_string()))
            .collect();
        {
            let mut locked = self.state.lock_tables();
            for key in &keys {
                locked.entry(key.clone()).or_default().read_only += 1;
            }
        }
        let guard = ReadOnlyLockGuard {
            state: Arc::clone(&self.state),
            keys,
        };

        loop {
            let drained = self.state.writers_done.notified();
            let in_flight = self.state.in_flight(&guard.keys);
            if in_flight == 0 {
                break;
            }
            debug!(plugin_id, in_flight, "Waiting for in-flight writes before migration");
            drained.await;
        }
        debug!(plugin_id, tables = guard.keys.len(), "Migration read-only lock acquired");
        Ok(guard)
    }

    /// Number of holders of the lock on `(plugin_id, table)`.
    pub fn lock_count(&self, plugin_id: &str, table: &str) -> usize {
        self.state
            .lock_tables()
            .get(&(plugin_id.to_string(), table.to_string()))
            .map_or(0, |state| state.read_only)
    }

    /// Writes admitted to `(plugin_id, table)` that have not finished yet.
    pub fn in_flight_writes(&self, plugin_id: &str, table: &str) -> usize {
        self.state
            .lock_tables()
            .get(&(plugin_id.to_string(), table.to_string()))
            .map_or(0, |state| state.writers)
    }
}

impl WriteLockProbe for MigrationLockManager {
    fn is_table_write_locked(&self, plugin_id: &str, table: &str) -> bool {
        self.lock_count(plugin_id, table) > 0
    }

    fn begin_write(&self, plugin_id: &str, table: &str) -> Option<WritePermit> {
        let key = (plugin_id.to_string(), table.to_string());
        {
            let mut tables = self.state.lock_tables();
            let state = tables.entry(key.clone()).or_default();
            if state.read_only > 0 {
                return None;
            }
            state.writers += 1;
        }
        let state = Arc::clone(&self.state);
        Some(WritePermit::new(move || state.end_write(&key)))
    }
}

/// Scoped hold on a set of table locks.
#[must_use = "the tables unlock as soon as the guard is dropped"]
pub struct ReadOnlyLockGuard {
    state: Arc<LockTable>,
    keys: Vec<LockKey>,
}

impl ReadOnlyLockGuard {
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(_, table)| table.as_str())
    }
}

impl Drop for ReadOnlyLockGuard {
    fn drop(&mut self) {
        self.state.release(&self.keys);
        debug!(tables = self.keys.len(), "Migration read-only lock released");
    }
}
