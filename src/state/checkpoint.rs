//! Per-item checkpoint bookkeeping on top of the session store.
//!
//! Layout inside the session document:
//!
//! | path | contents |
//! |---|---|
//! | `loop.progress.{context}` | processed item keys, in commit order |
//! | `loop.result.{context}` | accumulated loop result |
//! | `loop.error_attempts.{context}.{key}` | failure count for one item |
//! | `loop.skipped_items` | append-only [`SkipRecord`] list |
//! | `loop.consecutive_skips` | session-wide circuit-breaker counter |
//! | `loop.backup_attributes.{context}` | resumable state snapshot |
//! | `progress.{step}` | whole-step completion flags |

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::error::StateError;
use super::path;
use super::store::{SessionStore, UPDATED_AT_KEY};
use super::types::{SessionSummary, SkipRecord};

const SKIPPED_ITEMS_PATH: &str = "loop.skipped_items";
const CONSECUTIVE_SKIPS_PATH: &str = "loop.consecutive_skips";

fn progress_path(context: &str) -> String {
    path::join(&["loop", "progress", context])
}

fn result_path(context: &str) -> String {
    path::join(&["loop", "result", context])
}

fn attempts_path(context: &str, key: &str) -> String {
    path::join(&["loop", "error_attempts", context, key])
}

fn backup_path(context: &str) -> String {
    path::join(&["loop", "backup_attributes", context])
}

fn step_path(step: &str) -> String {
    path::join(&["progress", step])
}

fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, StateError> {
    serde_json::from_value(value).map_err(|source| StateError::Shape {
        path: path.to_string(),
        source,
    })
}

fn encode<T: Serialize>(path: &str, value: &T) -> Result<Value, StateError> {
    serde_json::to_value(value).map_err(|source| StateError::Shape {
        path: path.to_string(),
        source,
    })
}

/// Stored counters saturate at `u32::MAX` instead of wrapping.
fn counter(value: &Value) -> u32 {
    value
        .as_u64()
        .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

/// Tracks processed keys, results, error attempts and skips for one session.
///
/// Cheap to clone; all clones share the same store.
#[derive(Clone)]
pub struct CheckpointTracker {
    store: Arc<dyn SessionStore>,
    session_id: String,
}

impl std::fmt::Debug for CheckpointTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointTracker")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl CheckpointTracker {
    pub fn new(store: Arc<dyn SessionStore>, session_id: impl Into<String>) -> Self {
        Self {
            store,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    // ── Progress ──

    /// Keys committed for `context`, in commit order.
    pub async fn processed_keys(&self, context: &str) -> Result<Vec<String>, StateError> {
        let value = self
            .store
            .get(&self.session_id, &progress_path(context), Value::Null)
            .await?;
        Ok(match value {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        })
    }

    pub async fn is_processed(&self, context: &str, key: &str) -> Result<bool, StateError> {
        Ok(self.processed_keys(context).await?.iter().any(|k| k == key))
    }

    /// Mark `key` processed for `context`. Idempotent.
    pub async fn mark_processed(&self, context: &str, key: &str) -> Result<(), StateError> {
        if self.is_processed(context, key).await? {
            return Ok(());
        }
        self.store
            .append(&self.session_id, &progress_path(context), Value::from(key))
            .await
    }

    // ── Accumulated result ──

    pub async fn get_result<T: DeserializeOwned>(
        &self,
        context: &str,
    ) -> Result<Option<T>, StateError> {
        self.fetch(&result_path(context)).await
    }

    pub async fn set_result<T: Serialize>(&self, context: &str, result: &T) -> Result<(), StateError> {
        self.put(&result_path(context), result).await
    }

    // ── Skip-on-error ──

    pub async fn error_attempts(&self, context: &str, key: &str) -> Result<u32, StateError> {
        let value = self
            .store
            .get(&self.session_id, &attempts_path(context, key), Value::from(0))
            .await?;
        Ok(counter(&value))
    }

    /// Increment and return the failure count for one item.
    pub async fn increment_error_attempts(&self, context: &str, key: &str) -> Result<u32, StateError> {
        let next = self.error_attempts(context, key).await?.saturating_add(1);
        self.store
            .set(&self.session_id, &attempts_path(context, key), Value::from(next))
            .await?;
        Ok(next)
    }

    pub async fn reset_error_attempts(&self, context: &str, key: &str) -> Result<(), StateError> {
        self.store
            .set(&self.session_id, &attempts_path(context, key), Value::from(0))
            .await
    }

    /// Record that `key` was skipped. Other contexts are unaffected.
    pub async fn mark_skipped(
        &self,
        context: &str,
        key: &str,
        reason: &str,
    ) -> Result<SkipRecord, StateError> {
        let record = SkipRecord::new(context, key, reason);
        let value = encode(SKIPPED_ITEMS_PATH, &record)?;
        self.store
            .append(&self.session_id, SKIPPED_ITEMS_PATH, value)
            .await?;
        Ok(record)
    }

    pub async fn skipped_items(&self) -> Result<Vec<SkipRecord>, StateError> {
        Ok(self.fetch(SKIPPED_ITEMS_PATH).await?.unwrap_or_default())
    }

    pub async fn is_skipped(&self, context: &str, key: &str) -> Result<bool, StateError> {
        Ok(self
            .skipped_items()
            .await?
            .iter()
            .any(|r| r.context == context && r.key == key))
    }

    // ── Consecutive-skip circuit breaker (session-wide, not per context) ──

    pub async fn consecutive_skips(&self) -> Result<u32, StateError> {
        let value = self
            .store
            .get(&self.session_id, CONSECUTIVE_SKIPS_PATH, Value::from(0))
            .await?;
        Ok(counter(&value))
    }

    pub async fn increment_consecutive_skips(&self) -> Result<u32, StateError> {
        let next = self.consecutive_skips().await?.saturating_add(1);
        self.store
            .set(&self.session_id, CONSECUTIVE_SKIPS_PATH, Value::from(next))
            .await?;
        Ok(next)
    }

    pub async fn reset_consecutive_skips(&self) -> Result<(), StateError> {
        self.store
            .set(&self.session_id, CONSECUTIVE_SKIPS_PATH, Value::from(0))
            .await
    }

    // ── Resumable state snapshots ──

    pub async fn backup_state(&self, context: &str, snapshot: Value) -> Result<(), StateError> {
        self.store
            .set(&self.session_id, &backup_path(context), snapshot)
            .await
    }

    pub async fn restore_state(&self, context: &str) -> Result<Option<Value>, StateError> {
        let value = self
            .store
            .get(&self.session_id, &backup_path(context), Value::Null)
            .await?;
        Ok((!value.is_null()).then_some(value))
    }

    // ── Whole-step flags ──

    pub async fn is_step_complete(&self, step: &str) -> Result<bool, StateError> {
        let value = self
            .store
            .get(&self.session_id, &step_path(step), Value::Bool(false))
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    pub async fn mark_step_complete(&self, step: &str) -> Result<(), StateError> {
        self.store
            .set(&self.session_id, &step_path(step), Value::Bool(true))
            .await
    }

    // ── Typed access to arbitrary paths ──

    /// Read and decode the value at an already-built path.
    pub async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, StateError> {
        let value = self.store.get(&self.session_id, path, Value::Null).await?;
        if value.is_null() {
            return Ok(None);
        }
        decode(path, value).map(Some)
    }

    /// Encode and write a value at an already-built path.
    pub async fn put<T: Serialize>(&self, path: &str, value: &T) -> Result<(), StateError> {
        let value = encode(path, value)?;
        self.store.set(&self.session_id, path, value).await
    }

    /// Summarize this session for status output.
    pub async fn summary(&self) -> Result<SessionSummary, StateError> {
        let doc = self.store.load(&self.session_id).await?;

        let processed = path::lookup(&doc, "loop.progress")
            .and_then(Value::as_object)
            .map(|contexts| {
                contexts
                    .iter()
                    .map(|(ctx, keys)| (ctx.clone(), keys.as_array().map_or(0, Vec::len)))
                    .collect()
            })
            .unwrap_or_default();

        let consecutive_skips = path::lookup(&doc, CONSECUTIVE_SKIPS_PATH).map_or(0, counter);

        let skipped = match path::lookup(&doc, SKIPPED_ITEMS_PATH) {
            Some(value) => decode(SKIPPED_ITEMS_PATH, value.clone())?,
            None => Vec::new(),
        };

        let completed_steps = path::lookup(&doc, "progress")
            .and_then(Value::as_object)
            .map(|steps| {
                steps
                    .iter()
                    .filter(|(_, done)| done.as_bool() == Some(true))
                    .map(|(step, _)| step.clone())
                    .collect()
            })
            .unwrap_or_default();

        let updated_at = doc
            .get(UPDATED_AT_KEY)
            .and_then(Value::as_i64)
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single());

        Ok(SessionSummary {
            processed,
            consecutive_skips,
            skipped,
            completed_steps,
            updated_at,
        })
    }
}
