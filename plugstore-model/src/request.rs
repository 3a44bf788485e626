//! Request/response envelopes exchanged with a transport layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::canonical::Row;

/// The operations the engine exposes to plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageOp {
    #[serde(rename = "kv.get")]
    KvGet,
    #[serde(rename = "kv.set")]
    KvSet,
    #[serde(rename = "kv.delete")]
    KvDelete,
    #[serde(rename = "table.get")]
    TableGet,
    #[serde(rename = "table.upsert")]
    TableUpsert,
    #[serde(rename = "table.delete")]
    TableDelete,
    #[serde(rename = "table.query")]
    TableQuery,
}

impl StorageOp {
    /// Wire name, also used as the rate-limit bucket key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KvGet => "kv.get",
            Self::KvSet => "kv.set",
            Self::KvDelete => "kv.delete",
            Self::TableGet => "table.get",
            Self::TableUpsert => "table.upsert",
            Self::TableDelete => "table.delete",
            Self::TableQuery => "table.query",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::KvSet | Self::KvDelete | Self::TableUpsert | Self::TableDelete
        )
    }
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An already-parsed storage call.
///
/// `kv.set` carries its value as `row.value`; `table.get`/`table.delete` carry
/// the primary key in `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRequest {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default = "Utc::now")]
    pub ts: DateTime<Utc>,
    pub plugin_id: String,
    pub op: StorageOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub predicates: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<bool>,
}

impl StorageRequest {
    pub fn new(plugin_id: impl Into<String>, op: StorageOp) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            plugin_id: plugin_id.into(),
            op,
            table: None,
            key: None,
            predicates: None,
            limit: None,
            row: None,
            secret: None,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<Value>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_row(mut self, row: Row) -> Self {
        self.row = Some(row);
        self
    }

    pub fn with_where(mut self, predicates: Row) -> Self {
        self.predicates = Some(predicates);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_secret(mut self, secret: bool) -> Self {
        self.secret = Some(secret);
        self
    }
}

/// Wire form of an engine error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub ts: DateTime<Utc>,
}

/// Result of one storage call. Exactly one of `error`/`result` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageResponse {
    pub id: Uuid,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl StorageResponse {
    pub fn success(id: Uuid, result: Value) -> Self {
        Self {
            id,
            ok: true,
            error: None,
            result: Some(result),
        }
    }

    pub fn failure(id: Uuid, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            error: Some(ErrorPayload {
                code: code.into(),
                message: message.into(),
                ts: Utc::now(),
            }),
            result: None,
        }
    }
}
