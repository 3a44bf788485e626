use async_trait::async_trait;
use plugstore_migrate::{
    MigrationError, MigrationEvent, MigrationEventSink, MigrationLockManager, MigrationRequest, MigrationStatus,
    MigrationStrategy, StorageMigrationRunner, EVENT_MIGRATE_COMPLETED, EVENT_MIGRATE_FAILED, EVENT_MIGRATE_PROGRESS,
    EVENT_MIGRATE_STARTED,
};
use plugstore_model::{
    PluginStorageConfig, Row, StorageColumnType, StorageDdlColumnSpec, StorageDdlIndexSpec, StorageDdlSpec,
    StorageDdlTableSpec, StorageLimits, StorageMode, StorageTableSpec,
};
use plugstore_storage::{
    PhysicalStorage, PluginCatalog, PluginStorage, QuotaGuard, StorageBackend, StorageDb, StorageModeRouter,
    UniversalStorage, WriteLockProbe,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn widgets_ddl() -> StorageDdlSpec {
    StorageDdlSpec {
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
    }
}

fn config(ddl: Option<StorageDdlSpec>) -> PluginStorageConfig {
    PluginStorageConfig {
        mode: StorageMode::Universal,
        ddl,
        limits: StorageLimits {
            max_qps: 10_000.0,
            ..StorageLimits::default()
        },
        tables: vec![StorageTableSpec::new("widgets", "id", &["color"])],
    }
    .validated()
    .unwrap()
}

struct Harness {
    db: StorageDb,
    router: Arc<StorageModeRouter>,
    locks: Arc<MigrationLockManager>,
}

impl Harness {
    fn new() -> Self {
        Self::with_configs(BTreeMap::from([
            ("p1".to_string(), config(Some(widgets_ddl()))),
            ("plain".to_string(), config(None)),
        ]))
    }

    fn with_configs(configs: BTreeMap<String, PluginStorageConfig>) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let db = StorageDb::open_in_memory().unwrap();
        let catalog = PluginCatalog::new(configs);
        let quota = Arc::new(QuotaGuard::new());
        let universal = Arc::new(UniversalStorage::new(db.clone(), catalog.clone(), Arc::clone(&quota)));
        let physical = Arc::new(PhysicalStorage::new(db.clone(), catalog.clone(), quota));
        let locks = Arc::new(MigrationLockManager::new());
        let probe: Arc<dyn WriteLockProbe> = locks.clone();
        let router = Arc::new(StorageModeRouter::new(catalog, universal, physical).with_write_locks(probe));
        Self { db, router, locks }
    }

    fn runner(&self, events: Arc<dyn MigrationEventSink>) -> StorageMigrationRunner {
        StorageMigrationRunner::new(Arc::clone(&self.router), Arc::clone(&self.locks), events)
    }

    fn channel_runner(&self) -> (StorageMigrationRunner, mpsc::UnboundedReceiver<MigrationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.runner(Arc::new(tx)), rx)
    }

    async fn seed(&self, plugin_id: &str, rows: &[Value]) {
        for value in rows {
            self.router
                .table_upsert(plugin_id, "widgets", &row(value.clone()))
                .await
                .unwrap();
        }
    }
}

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn to_physical(plugin_id: &str) -> MigrationRequest {
    MigrationRequest::new(plugin_id, StorageMode::Universal, StorageMode::Physical, &["widgets"])
}

fn drain(rx: &mut mpsc::UnboundedReceiver<MigrationEvent>) -> Vec<MigrationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn event_types(events: &[MigrationEvent]) -> Vec<&'static str> {
    events.iter().map(MigrationEvent::event_type).collect()
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    for _ in 0..400 {
        if ready() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ── Happy path ───────────────────────────────────────────────────

#[tokio::test]
async fn migrates_universal_table_to_physical() {
    let harness = Harness::new();
    harness
        .seed(
            "p1",
            &[
                json!({"id": 1, "color": "red"}),
                json!({"id": 2, "color": "blue"}),
                json!({"id": 3, "color": "red"}),
            ],
        )
        .await;
    let (runner, mut rx) = harness.channel_runner();

    let report = runner.run(to_physical("p1").with_batch_size(2)).await.unwrap();
    assert_eq!(report.status, MigrationStatus::Completed);
    assert_eq!(report.copied_rows, BTreeMap::from([("widgets".to_string(), 3)]));
    assert_eq!(report.switched_tables, vec!["widgets".to_string()]);
    assert_eq!(report.plan[0].rows, 3);
    assert_eq!(report.strategy, MigrationStrategy::ReadOnlyLock);

    assert_eq!(
        harness.router.get_table_mode("p1", "widgets").unwrap(),
        StorageMode::Physical
    );
    let fetched = harness.router.table_get("p1", "widgets", &json!(2)).await.unwrap();
    assert_eq!(fetched, Some(row(json!({"id": 2, "color": "blue"}))));
    assert_eq!(
        harness.router.physical().count_table_rows("p1", "widgets").await.unwrap(),
        3
    );
    assert!(!harness.locks.is_table_write_locked("p1", "widgets"));

    let events = drain(&mut rx);
    assert_eq!(
        event_types(&events),
        vec![
            EVENT_MIGRATE_STARTED,
            EVENT_MIGRATE_PROGRESS,
            EVENT_MIGRATE_PROGRESS,
            EVENT_MIGRATE_COMPLETED
        ]
    );
    let progress: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            MigrationEvent::Progress { copied, .. } => Some(*copied),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![2, 3]);
    assert!(events.iter().all(|e| e.migration_id() == report.migration_id));
}

#[tokio::test]
async fn writes_resume_on_destination_after_switch() {
    let harness = Harness::new();
    harness.seed("p1", &[json!({"id": 1, "color": "red"})]).await;
    let (runner, _rx) = harness.channel_runner();
    runner.run(to_physical("p1")).await.unwrap();

    harness.seed("p1", &[json!({"id": 4, "color": "red"})]).await;
    let hits = harness
        .router
        .table_query("p1", "widgets", &row(json!({"color": "red"})), Some(10))
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    // The universal copy is left behind untouched.
    assert_eq!(
        harness.router.universal().count_table_rows("p1", "widgets").await.unwrap(),
        1
    );
}

#[tokio::test]
async fn migrates_back_to_universal() {
    let harness = Harness::new();
    harness.seed("p1", &[json!({"id": 1, "color": "red"}), json!({"id": 2})]).await;
    let (runner, _rx) = harness.channel_runner();
    runner.run(to_physical("p1")).await.unwrap();

    let back = MigrationRequest::new("p1", StorageMode::Physical, StorageMode::Universal, &["widgets"]);
    let report = runner.run(back).await.unwrap();
    assert_eq!(report.copied_rows["widgets"], 2);
    assert_eq!(
        harness.router.get_table_mode("p1", "widgets").unwrap(),
        StorageMode::Universal
    );
    let fetched = harness.router.table_get("p1", "widgets", &json!(2)).await.unwrap();
    assert_eq!(fetched, Some(row(json!({"id": 2, "color": null}))));
}

#[tokio::test]
async fn empty_table_migrates_without_progress_events() {
    let harness = Harness::new();
    let (runner, mut rx) = harness.channel_runner();
    let report = runner.run(to_physical("p1")).await.unwrap();
    assert_eq!(report.copied_rows["widgets"], 0);
    assert_eq!(
        event_types(&drain(&mut rx)),
        vec![EVENT_MIGRATE_STARTED, EVENT_MIGRATE_COMPLETED]
    );
}

// ── Dry run ──────────────────────────────────────────────────────

#[tokio::test]
async fn dry_run_only_plans() {
    let harness = Harness::new();
    harness.seed("p1", &[json!({"id": 1}), json!({"id": 2})]).await;
    let (runner, mut rx) = harness.channel_runner();

    let report = runner.run(to_physical("p1").with_dry_run(true)).await.unwrap();
    assert_eq!(report.status, MigrationStatus::Planned);
    assert_eq!(report.plan[0].rows, 2);
    assert!(report.copied_rows.is_empty());
    assert!(report.switched_tables.is_empty());
    assert_eq!(
        harness.router.get_table_mode("p1", "widgets").unwrap(),
        StorageMode::Universal
    );

    let events = drain(&mut rx);
    assert_eq!(event_types(&events), vec![EVENT_MIGRATE_STARTED, EVENT_MIGRATE_COMPLETED]);
    assert!(matches!(
        &events[1],
        MigrationEvent::Completed { status: MigrationStatus::Planned, dry_run: true, .. }
    ));
}

// ── Validation ───────────────────────────────────────────────────

#[tokio::test]
async fn validation_failures_publish_nothing() {
    let harness = Harness::new();
    let (runner, mut rx) = harness.channel_runner();

    let err = runner
        .run(MigrationRequest::new("p1", StorageMode::Universal, StorageMode::Physical, &["gadgets"]))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::TableNotAllowed(_)));
    assert_eq!(err.status(), 422);

    let err = runner
        .run(MigrationRequest::new("p1", StorageMode::Physical, StorageMode::Universal, &["widgets"]))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::ModeMismatch(_)));
    assert_eq!(err.status(), 409);

    let err = runner.run(to_physical("plain")).await.unwrap_err();
    assert_eq!(err.code(), "storage_migration_missing_ddl");

    let err = runner
        .run(to_physical("p1").with_strategy(MigrationStrategy::DualWrite))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "storage_migration_strategy_not_supported");

    let err = runner.run(to_physical("p1").with_batch_size(0)).await.unwrap_err();
    assert_eq!(err.code(), "storage_migration_invalid_payload");

    let err = runner.run(to_physical("ghost")).await.unwrap_err();
    assert_eq!(err.code(), "storage_query_not_allowed");

    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn second_migration_of_same_table_is_a_mode_mismatch() {
    let harness = Harness::new();
    let (runner, _rx) = harness.channel_runner();
    runner.run(to_physical("p1")).await.unwrap();
    let err = runner.run(to_physical("p1")).await.unwrap_err();
    assert!(matches!(err, MigrationError::ModeMismatch(_)));
}

// ── Locking ──────────────────────────────────────────────────────

/// Tries a plugin write whenever a batch lands, while the table is still locked.
struct WriteDuringCopy {
    router: Arc<StorageModeRouter>,
    locks: Arc<MigrationLockManager>,
    outcomes: Mutex<Vec<(bool, String)>>,
}

#[async_trait]
impl MigrationEventSink for WriteDuringCopy {
    async fn publish(&self, event: MigrationEvent) {
        if let MigrationEvent::Progress { plugin_id, table, .. } = event {
            let locked = self.locks.is_table_write_locked(&plugin_id, &table);
            let outcome = self
                .router
                .table_upsert(&plugin_id, &table, &row(json!({"id": 99, "color": "green"})))
                .await;
            let code = match outcome {
                Ok(_) => "ok".to_string(),
                Err(e) => e.code().to_string(),
            };
            self.outcomes.lock().unwrap().push((locked, code));
        }
    }
}

#[tokio::test]
async fn writes_are_rejected_mid_copy() {
    let harness = Harness::new();
    harness
        .seed("p1", &[json!({"id": 1}), json!({"id": 2}), json!({"id": 3})])
        .await;
    let sink = Arc::new(WriteDuringCopy {
        router: Arc::clone(&harness.router),
        locks: Arc::clone(&harness.locks),
        outcomes: Mutex::new(Vec::new()),
    });
    let runner = harness.runner(sink.clone());

    let report = runner.run(to_physical("p1").with_batch_size(1)).await.unwrap();
    assert_eq!(report.copied_rows["widgets"], 3);

    let outcomes = sink.outcomes.lock().unwrap().clone();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes
        .iter()
        .all(|(locked, code)| *locked && code == "storage_query_not_allowed"));
    assert!(harness
        .router
        .table_get("p1", "widgets", &json!(99))
        .await
        .unwrap()
        .is_none());

    // Unlocked again once the migration returns.
    harness.seed("p1", &[json!({"id": 99})]).await;
}

#[tokio::test]
async fn write_admitted_before_lock_is_copied() {
    let harness = Harness::new();
    harness.seed("p1", &[json!({"id": 1, "color": "red"})]).await;
    let (runner, _rx) = harness.channel_runner();
    let runner = Arc::new(runner);

    // Stall the database so the write is admitted but cannot land yet.
    let conn = harness.db.lock_conn();
    let writer = tokio::spawn({
        let router = Arc::clone(&harness.router);
        async move {
            router
                .table_upsert("p1", "widgets", &row(json!({"id": 2, "color": "late"})))
                .await
        }
    });
    wait_until(|| harness.locks.in_flight_writes("p1", "widgets") == 1).await;

    let migration = tokio::spawn({
        let runner = Arc::clone(&runner);
        async move { runner.run(to_physical("p1")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!migration.is_finished());
    drop(conn);

    writer.await.unwrap().unwrap();
    let report = migration.await.unwrap().unwrap();
    assert_eq!(report.copied_rows["widgets"], 2);
    assert_eq!(harness.locks.in_flight_writes("p1", "widgets"), 0);

    assert_eq!(
        harness.router.get_table_mode("p1", "widgets").unwrap(),
        StorageMode::Physical
    );
    assert_eq!(
        harness.router.table_get("p1", "widgets", &json!(2)).await.unwrap(),
        Some(row(json!({"id": 2, "color": "late"})))
    );
}

#[tokio::test]
async fn reads_stay_available_mid_copy() {
    struct ReadDuringCopy {
        router: Arc<StorageModeRouter>,
        seen: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl MigrationEventSink for ReadDuringCopy {
        async fn publish(&self, event: MigrationEvent) {
            if let MigrationEvent::Progress { plugin_id, table, .. } = event {
                let found = self.router.table_get(&plugin_id, &table, &json!(1)).await;
                self.seen.lock().unwrap().push(matches!(found, Ok(Some(_))));
            }
        }
    }

    let harness = Harness::new();
    harness.seed("p1", &[json!({"id": 1}), json!({"id": 2})]).await;
    let sink = Arc::new(ReadDuringCopy {
        router: Arc::clone(&harness.router),
        seen: Mutex::new(Vec::new()),
    });
    harness.runner(sink.clone()).run(to_physical("p1").with_batch_size(1)).await.unwrap();
    assert_eq!(*sink.seen.lock().unwrap(), vec![true, true]);
}

// ── Failure ──────────────────────────────────────────────────────

#[tokio::test]
async fn copy_failure_releases_locks_and_keeps_mode() {
    let harness = Harness::new();
    // Universal rows are schemaless; `owner` has no physical column.
    harness
        .seed("p1", &[json!({"id": 1, "color": "red"}), json!({"id": 2, "owner": "root"})])
        .await;
    let (runner, mut rx) = harness.channel_runner();

    let err = runner.run(to_physical("p1").with_batch_size(1)).await.unwrap_err();
    assert_eq!(err.code(), "storage_query_not_allowed");
    assert_eq!(err.status(), 422);

    assert!(!harness.locks.is_table_write_locked("p1", "widgets"));
    assert_eq!(
        harness.router.get_table_mode("p1", "widgets").unwrap(),
        StorageMode::Universal
    );

    let events = drain(&mut rx);
    assert_eq!(
        event_types(&events),
        vec![EVENT_MIGRATE_STARTED, EVENT_MIGRATE_PROGRESS, EVENT_MIGRATE_FAILED]
    );
    match events.last() {
        Some(MigrationEvent::Failed { error, .. }) => {
            assert!(error.starts_with("storage_query_not_allowed: "), "{error}");
        }
        other => panic!("expected failure event, got {other:?}"),
    }

    // The row copied before the failure stays in the destination.
    assert_eq!(
        harness.router.physical().count_table_rows("p1", "widgets").await.unwrap(),
        1
    );
}
