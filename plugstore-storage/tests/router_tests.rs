use plugstore_model::{
    PluginStorageConfig, Row, StorageColumnType, StorageDdlColumnSpec, StorageDdlIndexSpec, StorageDdlSpec,
    StorageDdlTableSpec, StorageLimits, StorageMode, StorageTableSpec,
};
use plugstore_storage::{
    PhysicalStorage, PluginCatalog, PluginStorage, QuotaGuard, StorageDb, StorageError, StorageModeRouter,
    UniversalStorage, WriteLockProbe,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("plugstore_storage=debug")
        .with_test_writer()
        .try_init();
}

/// A universal plugin whose DDL describes the physical target.
fn inventory() -> PluginStorageConfig {
    PluginStorageConfig {
        mode: StorageMode::Universal,
        ddl: Some(StorageDdlSpec {
            version: 1,
            tables: vec![StorageDdlTableSpec {
                name: "widgets".into(),
                primary_key: "id".into(),
                columns: vec![
                    StorageDdlColumnSpec::new("id", StorageColumnType::Integer, false),
                    StorageDdlColumnSpec::new("color", StorageColumnType::String, true),
                ],
                indexes: vec![StorageDdlIndexSpec::new("by_color", &["color"], false)],
            }],
        }),
        limits: StorageLimits {
            max_qps: 10_000.0,
            ..StorageLimits::default()
        },
        tables: vec![StorageTableSpec::new("widgets", "id", &["color"])],
    }
    .validated()
    .unwrap()
}

#[derive(Default)]
struct FixedLocks(Mutex<HashSet<(String, String)>>);

impl FixedLocks {
    fn lock(&self, plugin_id: &str, table: &str) {
        self.0.lock().unwrap().insert((plugin_id.to_string(), table.to_string()));
    }
}

impl WriteLockProbe for FixedLocks {
    fn is_table_write_locked(&self, plugin_id: &str, table: &str) -> bool {
        self.0.lock().unwrap().contains(&(plugin_id.to_string(), table.to_string()))
    }
}

fn router() -> (StorageModeRouter, Arc<FixedLocks>) {
    init_tracing();
    let db = StorageDb::open_in_memory().unwrap();
    let catalog = PluginCatalog::new(BTreeMap::from([("inventory".to_string(), inventory())]));
    let quota = Arc::new(QuotaGuard::new());
    let universal = Arc::new(UniversalStorage::new(db.clone(), catalog.clone(), Arc::clone(&quota)));
    let physical = Arc::new(PhysicalStorage::new(db, catalog.clone(), quota));
    let locks = Arc::new(FixedLocks::default());
    let probe: Arc<dyn WriteLockProbe> = locks.clone();
    (StorageModeRouter::new(catalog, universal, physical).with_write_locks(probe), locks)
}

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

// ── Mode resolution ──────────────────────────────────────────────

#[tokio::test]
async fn table_mode_defaults_to_plugin_mode() {
    let (router, _) = router();
    assert_eq!(router.get_table_mode("inventory", "widgets").unwrap(), StorageMode::Universal);
    assert!(router.get_table_mode("ghost", "widgets").is_err());
    assert!(router.set_table_mode("ghost", "widgets", StorageMode::Physical).is_err());
}

#[tokio::test]
async fn override_is_authoritative() {
    let (router, _) = router();
    router
        .table_upsert("inventory", "widgets", &row(json!({"id": 1, "color": "red"})))
        .await
        .unwrap();

    router.set_table_mode("inventory", "widgets", StorageMode::Physical).unwrap();
    assert_eq!(router.get_table_mode("inventory", "widgets").unwrap(), StorageMode::Physical);
    // The physical table is empty; the universal copy must not leak through.
    assert!(router.table_get("inventory", "widgets", &json!(1)).await.unwrap().is_none());

    router
        .table_upsert("inventory", "widgets", &row(json!({"id": 2, "color": "blue"})))
        .await
        .unwrap();
    let hits = router
        .table_query("inventory", "widgets", &row(json!({"color": "blue"})), Some(10))
        .await
        .unwrap();
    assert_eq!(hits, vec![row(json!({"id": 2, "color": "blue"}))]);

    router.clear_table_mode_override("inventory", "widgets");
    assert_eq!(
        router.table_get("inventory", "widgets", &json!(1)).await.unwrap(),
        Some(row(json!({"id": 1, "color": "red"})))
    );
    assert!(router.table_get("inventory", "widgets", &json!(2)).await.unwrap().is_none());
}

#[tokio::test]
async fn kv_follows_plugin_mode() {
    let (router, _) = router();
    router.set_table_mode("inventory", "widgets", StorageMode::Physical).unwrap();
    router.kv_set("inventory", "last_sync", &json!("now"), false).await.unwrap();
    assert_eq!(
        router.universal().kv_get("inventory", "last_sync", false).await.unwrap(),
        Some(json!("now"))
    );
}

// ── Write locks ──────────────────────────────────────────────────

#[tokio::test]
async fn locked_table_rejects_writes_but_serves_reads() {
    let (router, locks) = router();
    router
        .table_upsert("inventory", "widgets", &row(json!({"id": 1, "color": "red"})))
        .await
        .unwrap();
    locks.lock("inventory", "widgets");

    let err = router
        .table_upsert("inventory", "widgets", &row(json!({"id": 2})))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::QueryNotAllowed(_)));
    assert_eq!(
        err.to_string(),
        "Storage table 'widgets' for plugin 'inventory' is read-only during migration; operation 'table_upsert' is denied"
    );

    let err = router.table_delete("inventory", "widgets", &json!(1)).await.unwrap_err();
    assert!(err.to_string().contains("'table_delete'"));

    assert!(router.table_get("inventory", "widgets", &json!(1)).await.unwrap().is_some());
    // KV is never locked.
    router.kv_set("inventory", "k", &json!(1), false).await.unwrap();
}
