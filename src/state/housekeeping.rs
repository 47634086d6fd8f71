//! Session garbage collection.
//!
//! Abandoned sessions are never resumed and simply stop accumulating
//! progress. Sweeps are disabled unless explicitly turned on; a disabled
//! sweep returns an empty report without touching the store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;

use super::error::StateError;
use super::store::{SessionStore, UPDATED_AT_KEY};
use super::types::HousekeepingReport;

/// Key under which a session records the batch it belongs to.
pub const BATCH_ID_KEY: &str = "batch_id";

pub struct Housekeeper {
    store: Arc<dyn SessionStore>,
    enabled: bool,
}

impl Housekeeper {
    pub fn new(store: Arc<dyn SessionStore>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Delete every session whose last write is older than `max_age_days`.
    ///
    /// Sessions with no `_updated_at` stamp (legacy documents) are treated
    /// as expired.
    pub async fn cleanup_expired(&self, max_age_days: u32) -> Result<HousekeepingReport, StateError> {
        if !self.enabled {
            tracing::debug!("Session housekeeping disabled, skipping expiry sweep");
            return Ok(HousekeepingReport::default());
        }

        let cutoff = (Utc::now() - Duration::days(i64::from(max_age_days))).timestamp();
        let mut report = HousekeepingReport::default();

        for (session_id, doc) in self.store.list_sessions().await? {
            let updated_at = doc.get(UPDATED_AT_KEY).and_then(Value::as_i64).unwrap_or(0);
            if updated_at < cutoff && self.store.delete(&session_id).await? {
                report.removed_ids.push(session_id);
            }
        }

        if report.removed_count() > 0 {
            tracing::info!(removed = report.removed_count(), "Removed expired sessions");
        }
        Ok(report)
    }

    /// Delete every session tagged with `batch_id`, except `keep_session`.
    pub async fn delete_by_batch(
        &self,
        batch_id: &str,
        keep_session: Option<&str>,
    ) -> Result<HousekeepingReport, StateError> {
        if !self.enabled {
            tracing::debug!("Session housekeeping disabled, skipping batch sweep");
            return Ok(HousekeepingReport::default());
        }

        let mut report = HousekeepingReport::default();
        for (session_id, doc) in self.store.list_sessions().await? {
            if keep_session == Some(session_id.as_str()) {
                continue;
            }
            let tagged = doc.get(BATCH_ID_KEY).and_then(Value::as_str) == Some(batch_id);
            if tagged && self.store.delete(&session_id).await? {
                report.removed_ids.push(session_id);
            }
        }

        if report.removed_count() > 0 {
            tracing::info!(
                batch = %batch_id,
                removed = report.removed_count(),
                "Removed sessions from batch"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SqliteSessionStore;
    use serde_json::json;

    fn store() -> Arc<dyn SessionStore> {
        Arc::new(SqliteSessionStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_disabled_is_a_no_op() {
        let store = store();
        store.set("S1", BATCH_ID_KEY, json!("B")).await.unwrap();
        let hk = Housekeeper::new(store.clone(), false);

        assert_eq!(hk.cleanup_expired(0).await.unwrap().removed_count(), 0);
        assert_eq!(hk.delete_by_batch("B", None).await.unwrap().removed_count(), 0);
        assert!(!store.load("S1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_batch_keeps_current_session() {
        let store = store();
        store.set("S1", BATCH_ID_KEY, json!("B")).await.unwrap();
        store.set("S2", BATCH_ID_KEY, json!("B")).await.unwrap();
        store.set("S3", BATCH_ID_KEY, json!("other")).await.unwrap();
        let hk = Housekeeper::new(store.clone(), true);

        let report = hk.delete_by_batch("B", Some("S2")).await.unwrap();
        assert_eq!(report.removed_ids, vec!["S1"]);
        assert!(!store.load("S2").await.unwrap().is_empty());
        assert!(!store.load("S3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_expired_removes_unstamped_legacy() {
        let sqlite = SqliteSessionStore::open_in_memory().unwrap();
        sqlite.write_legacy(&json!({"OLD": {"x": 1}})).unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(sqlite);
        store.set("FRESH", "x", json!(1)).await.unwrap();
        let hk = Housekeeper::new(store.clone(), true);

        let report = hk.cleanup_expired(1).await.unwrap();
        assert_eq!(report.removed_ids, vec!["OLD"]);
        assert!(!store.load("FRESH").await.unwrap().is_empty());
    }
}
