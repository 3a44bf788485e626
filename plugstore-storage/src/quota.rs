//! Per-plugin rate limiting and payload size ceilings.

use crate::error::{StorageError, StorageResult};
use plugstore_model::{canonical_json, StorageLimits, StorageOp};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    updated_at: Instant,
}

/// Token-bucket limiter keyed by `(plugin_id, op)` plus byte-size checks.
///
/// Buckets hold `max(1, max_qps)` tokens and refill at `max_qps` tokens per
/// second. Calls never wait: an empty bucket fails with `RateLimited`.
#[derive(Debug, Default)]
pub struct QuotaGuard {
    buckets: Mutex<HashMap<(String, StorageOp), TokenBucket>>,
}

impl QuotaGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one token for `op`, or fail with `RateLimited`.
    pub fn consume(&self, plugin_id: &str, op: StorageOp, limits: &StorageLimits) -> StorageResult<()> {
        self.consume_at(plugin_id, op, limits, Instant::now())
    }

    pub(crate) fn consume_at(
        &self,
        plugin_id: &str,
        op: StorageOp,
        limits: &StorageLimits,
        now: Instant,
    ) -> StorageResult<()> {
        let qps = limits.max_qps;
        let capacity = qps.max(1.0);
        let mut buckets = self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(bucket) = buckets.get_mut(&(plugin_id.to_string(), op)) else {
            buckets.insert(
                (plugin_id.to_string(), op),
                TokenBucket {
                    tokens: capacity - 1.0,
                    updated_at: now,
                },
            );
            return Ok(());
        };

        let elapsed = now.saturating_duration_since(bucket.updated_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * qps).min(capacity);
        bucket.updated_at = now;

        if bucket.tokens < 1.0 {
            debug!(plugin_id, op = %op, max_qps = qps, "Rate limit exceeded");
            return Err(StorageError::RateLimited(format!(
                "Rate limit exceeded for plugin '{plugin_id}' operation '{op}' (max_qps={qps})"
            )));
        }
        bucket.tokens -= 1.0;
        Ok(())
    }

    /// Canonicalize a KV value and check it against `max_kv_bytes`.
    ///
    /// Returns the canonical encoding and its byte length.
    pub fn enforce_kv_bytes(value: &Value, limits: &StorageLimits) -> StorageResult<(String, usize)> {
        let serialized = canonicalize(value)?;
        let bytes = serialized.len();
        if bytes > limits.max_kv_bytes {
            return Err(StorageError::limit(format!(
                "KV value exceeds max_kv_bytes ({bytes}>{})",
                limits.max_kv_bytes
            )));
        }
        Ok((serialized, bytes))
    }

    /// Canonicalize a row and check it against `max_row_bytes`.
    pub fn enforce_row_bytes(row: &Value, limits: &StorageLimits) -> StorageResult<(String, usize)> {
        let serialized = canonicalize(row)?;
        let bytes = serialized.len();
        if bytes > limits.max_row_bytes {
            return Err(StorageError::limit(format!(
                "Row exceeds max_row_bytes ({bytes}>{})",
                limits.max_row_bytes
            )));
        }
        Ok((serialized, bytes))
    }

    /// Transport-facing limit check: an explicit limit is required and is
    /// clamped to `[1, max_query_limit]`.
    pub fn clamp_query_limit(requested: Option<u32>, limits: &StorageLimits) -> StorageResult<u32> {
        match requested {
            None => Err(StorageError::not_allowed("table.query requires explicit limit")),
            Some(limit) => Ok(limit.clamp(1, limits.max_query_limit)),
        }
    }

    /// Backend-facing limit: an absent limit means `max_query_limit`.
    pub fn effective_query_limit(requested: Option<u32>, limits: &StorageLimits) -> u32 {
        requested.map_or(limits.max_query_limit, |limit| limit.clamp(1, limits.max_query_limit))
    }
}

fn canonicalize(value: &Value) -> StorageResult<String> {
    canonical_json(value)
        .map_err(|e| StorageError::limit(format!("Payload is not serializable: {e}")))
}
