//! Types for the session state module.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A record of one item skipped by the loop executor.
///
/// Append-only: once written to `loop.skipped_items` it is never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRecord {
    /// Execution context the item belonged to.
    pub context: String,
    /// Item key within that context.
    pub key: String,
    /// Why the item was skipped (the failure message, or the attempt cap).
    pub reason: String,
    /// Unix seconds when the skip was recorded.
    pub timestamp: i64,
}

impl SkipRecord {
    pub fn new(context: &str, key: &str, reason: &str) -> Self {
        Self {
            context: context.to_string(),
            key: key.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now().timestamp(),
        }
    }

    /// When the skip was recorded.
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp, 0).single()
    }
}

/// Point-in-time summary of one session, for status reporting.
#[derive(Debug, Clone, Default)]
pub struct SessionSummary {
    /// Number of processed keys per execution context.
    pub processed: BTreeMap<String, usize>,
    /// Session-wide consecutive-skip counter.
    pub consecutive_skips: u32,
    /// Every skip recorded so far, oldest first.
    pub skipped: Vec<SkipRecord>,
    /// Import steps marked complete.
    pub completed_steps: Vec<String>,
    /// Last write to the session document.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Outcome of a housekeeping sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub removed_ids: Vec<String>,
}

impl HousekeepingReport {
    pub fn removed_count(&self) -> usize {
        self.removed_ids.len()
    }
}
