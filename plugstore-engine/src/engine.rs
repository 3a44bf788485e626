//! Assembly of the storage stack behind one handle.

use crate::config::EngineConfig;
use crate::error::EngineResult;
use plugstore_migrate::{
    MigrationEventSink, MigrationLockManager, MigrationReport, MigrationRequest, MigrationResult,
    StorageMigrationRunner, TracingEventSink,
};
use plugstore_model::{load_plugin_configs, PluginStorageConfig, StorageMode, StorageRequest, StorageResponse};
use plugstore_storage::{
    PhysicalStorage, PluginCatalog, QuotaGuard, StorageDb, StorageModeRouter, StorageRpc, UniversalStorage,
    WriteLockProbe,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// One storage database shared by every plugin, with both backends, the
/// mode router, the RPC dispatcher and the migration runner wired together.
pub struct StorageEngine {
    config: EngineConfig,
    db: StorageDb,
    catalog: PluginCatalog,
    router: Arc<StorageModeRouter>,
    locks: Arc<MigrationLockManager>,
    rpc: StorageRpc,
    migrations: StorageMigrationRunner,
}

impl StorageEngine {
    /// Open the engine, reading plugin configs from `config.plugins_path`.
    pub async fn open(config: EngineConfig) -> EngineResult<Self> {
        let plugins = match config.plugins_path.as_deref() {
            Some(path) => load_plugin_configs(path)?,
            None => BTreeMap::new(),
        };
        Self::with_plugins(config, plugins).await
    }

    /// Open the engine with an explicit plugin set, logging migration events.
    pub async fn with_plugins(
        config: EngineConfig,
        plugins: BTreeMap<String, PluginStorageConfig>,
    ) -> EngineResult<Self> {
        Self::with_event_sink(config, plugins, Arc::new(TracingEventSink)).await
    }

    /// Open the engine with an explicit plugin set and migration event sink.
    pub async fn with_event_sink(
        config: EngineConfig,
        plugins: BTreeMap<String, PluginStorageConfig>,
        events: Arc<dyn MigrationEventSink>,
    ) -> EngineResult<Self> {
        let plugins = plugins
            .into_iter()
            .map(|(plugin_id, plugin)| -> EngineResult<_> { Ok((plugin_id, plugin.validated()?)) })
            .collect::<EngineResult<BTreeMap<_, _>>>()?;

        let db = match config.database_path.as_deref() {
            Some(path) => StorageDb::open(path, &config.memory_limit, config.threads)?,
            None => StorageDb::open_in_memory()?,
        };
        let catalog = PluginCatalog::new(plugins);
        catalog.check_physical_names()?;
        let quota = Arc::new(QuotaGuard::new());
        let universal = Arc::new(UniversalStorage::new(db.clone(), catalog.clone(), Arc::clone(&quota)));
        let physical = Arc::new(PhysicalStorage::new(db.clone(), catalog.clone(), quota));

        if config.install_on_open {
            physical.install_all().await?;
        }

        let locks = Arc::new(MigrationLockManager::new());
        let probe: Arc<dyn WriteLockProbe> = locks.clone();
        let router = Arc::new(StorageModeRouter::new(catalog.clone(), universal, physical).with_write_locks(probe));
        let rpc = StorageRpc::new(Arc::clone(&router));
        let migrations = StorageMigrationRunner::new(Arc::clone(&router), Arc::clone(&locks), events);

        info!(
            plugins = catalog.plugin_ids().count(),
            persistent = config.database_path.is_some(),
            "Storage engine ready"
        );
        Ok(Self {
            config,
            db,
            catalog,
            router,
            locks,
            rpc,
            migrations,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &PluginCatalog {
        &self.catalog
    }

    /// Plugin-facing storage operations, routed per table.
    pub fn router(&self) -> &Arc<StorageModeRouter> {
        &self.router
    }

    pub fn locks(&self) -> &Arc<MigrationLockManager> {
        &self.locks
    }

    /// Serve one request envelope.
    pub async fn call(&self, request: StorageRequest) -> StorageResponse {
        self.rpc.call(request).await
    }

    /// Build a migration request using the engine's default batch size.
    pub fn migration_request(
        &self,
        plugin_id: &str,
        from_mode: StorageMode,
        to_mode: StorageMode,
        tables: &[&str],
    ) -> MigrationRequest {
        MigrationRequest::new(plugin_id, from_mode, to_mode, tables).with_batch_size(self.config.default_batch_size)
    }

    pub async fn migrate(&self, request: MigrationRequest) -> MigrationResult<MigrationReport> {
        self.migrations.run(request).await
    }

    /// Flush the database WAL.
    pub fn checkpoint(&self) -> EngineResult<()> {
        self.db.checkpoint()?;
        Ok(())
    }
}
