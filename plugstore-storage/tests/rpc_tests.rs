use plugstore_model::{
    PluginStorageConfig, Row, StorageLimits, StorageOp, StorageRequest, StorageResponse, StorageTableSpec,
};
use plugstore_storage::{
    PhysicalStorage, PluginCatalog, QuotaGuard, StorageDb, StorageModeRouter, StorageRpc, UniversalStorage,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

fn rpc_with(limits: StorageLimits) -> StorageRpc {
    let config = PluginStorageConfig {
        limits,
        tables: vec![StorageTableSpec::new("notes", "id", &["tag"])],
        ..PluginStorageConfig::default()
    }
    .validated()
    .unwrap();
    let db = StorageDb::open_in_memory().unwrap();
    let catalog = PluginCatalog::new(BTreeMap::from([("notes".to_string(), config)]));
    let quota = Arc::new(QuotaGuard::new());
    let universal = Arc::new(UniversalStorage::new(db.clone(), catalog.clone(), Arc::clone(&quota)));
    let physical = Arc::new(PhysicalStorage::new(db, catalog.clone(), quota));
    StorageRpc::new(Arc::new(StorageModeRouter::new(catalog, universal, physical)))
}

fn rpc() -> StorageRpc {
    rpc_with(StorageLimits {
        max_qps: 10_000.0,
        ..StorageLimits::default()
    })
}

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn error_code(response: &StorageResponse) -> &str {
    assert!(!response.ok);
    assert!(response.result.is_none());
    response.error.as_ref().map(|e| e.code.as_str()).unwrap()
}

// ── KV envelopes ─────────────────────────────────────────────────

#[tokio::test]
async fn kv_roundtrip_through_envelopes() {
    let rpc = rpc();
    let set = StorageRequest::new("notes", StorageOp::KvSet)
        .with_key("draft")
        .with_row(row(json!({"value": {"text": "hi"}})));
    let id = set.id;
    let response = rpc.call(set).await;
    assert_eq!(response.id, id);
    assert!(response.ok);
    assert_eq!(response.result, Some(json!({"ok": true})));

    let response = rpc.call(StorageRequest::new("notes", StorageOp::KvGet).with_key("draft")).await;
    assert_eq!(response.result, Some(json!({"value": {"text": "hi"}})));

    let response = rpc.call(StorageRequest::new("notes", StorageOp::KvDelete).with_key("draft")).await;
    assert_eq!(response.result, Some(json!({"deleted": true})));

    let response = rpc.call(StorageRequest::new("notes", StorageOp::KvGet).with_key("draft")).await;
    assert_eq!(response.result, Some(json!({"value": null})));
}

#[tokio::test]
async fn kv_secret_flag_travels_in_envelope() {
    let rpc = rpc();
    let set = StorageRequest::new("notes", StorageOp::KvSet)
        .with_key("token")
        .with_row(row(json!({"value": "abc"})))
        .with_secret(true);
    assert!(rpc.call(set).await.ok);

    let response = rpc.call(StorageRequest::new("notes", StorageOp::KvGet).with_key("token")).await;
    assert_eq!(error_code(&response), "storage_query_not_allowed");

    let response = rpc
        .call(StorageRequest::new("notes", StorageOp::KvGet).with_key("token").with_secret(true))
        .await;
    assert_eq!(response.result, Some(json!({"value": "abc"})));
}

#[tokio::test]
async fn missing_fields_are_rejected() {
    let rpc = rpc();
    let response = rpc.call(StorageRequest::new("notes", StorageOp::KvGet)).await;
    assert_eq!(error_code(&response), "storage_query_not_allowed");

    let response = rpc
        .call(StorageRequest::new("notes", StorageOp::KvSet).with_key("k").with_row(Row::new()))
        .await;
    assert_eq!(response.error.unwrap().message, "kv.set requires row.value");

    let response = rpc.call(StorageRequest::new("notes", StorageOp::TableGet).with_key(1)).await;
    assert_eq!(response.error.unwrap().message, "table is required");
}

// ── Table envelopes ──────────────────────────────────────────────

#[tokio::test]
async fn table_ops_through_envelopes() {
    let rpc = rpc();
    for (id, tag) in [(1, "work"), (2, "home"), (3, "work")] {
        let response = rpc
            .call(
                StorageRequest::new("notes", StorageOp::TableUpsert)
                    .with_table("notes")
                    .with_row(row(json!({"id": id, "tag": tag}))),
            )
            .await;
        assert_eq!(response.result, Some(json!({"row": {"id": id, "tag": tag}})));
    }

    let response = rpc
        .call(StorageRequest::new("notes", StorageOp::TableGet).with_table("notes").with_key(2))
        .await;
    assert_eq!(response.result, Some(json!({"row": {"id": 2, "tag": "home"}})));

    let response = rpc
        .call(
            StorageRequest::new("notes", StorageOp::TableQuery)
                .with_table("notes")
                .with_where(row(json!({"tag": "work"})))
                .with_limit(10),
        )
        .await;
    assert_eq!(
        response.result,
        Some(json!({"rows": [{"id": 1, "tag": "work"}, {"id": 3, "tag": "work"}]}))
    );

    let response = rpc
        .call(StorageRequest::new("notes", StorageOp::TableDelete).with_table("notes").with_key(3))
        .await;
    assert_eq!(response.result, Some(json!({"deleted": true})));
}

#[tokio::test]
async fn query_requires_explicit_limit() {
    let rpc = rpc();
    let response = rpc
        .call(
            StorageRequest::new("notes", StorageOp::TableQuery)
                .with_table("notes")
                .with_where(row(json!({"tag": "work"}))),
        )
        .await;
    assert_eq!(error_code(&response), "storage_query_not_allowed");
    assert!(response.error.unwrap().message.contains("explicit limit"));
}

#[tokio::test]
async fn rate_limit_maps_to_wire_code() {
    let rpc = rpc_with(StorageLimits {
        max_qps: 1.0,
        ..StorageLimits::default()
    });
    let get = || StorageRequest::new("notes", StorageOp::KvGet).with_key("k");
    assert!(rpc.call(get()).await.ok);
    let response = rpc.call(get()).await;
    assert_eq!(error_code(&response), "storage_rate_limited");
}

#[tokio::test]
async fn request_deserializes_from_wire_json() {
    let rpc = rpc();
    let request: StorageRequest = serde_json::from_value(json!({
        "plugin_id": "notes",
        "op": "table.query",
        "table": "notes",
        "where": {"tag": "none"},
        "limit": 5
    }))
    .unwrap();
    let response = rpc.call(request).await;
    let wire = serde_json::to_value(&response).unwrap();
    assert_eq!(wire["ok"], json!(true));
    assert_eq!(wire["result"], json!({"rows": []}));
}
