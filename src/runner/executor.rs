//! Checkpointed iteration.
//!
//! [`LoopExecutor::run`] walks a keyed work collection, consulting the
//! checkpoint tracker before and after each item. A key committed for a
//! context is never handed to the operation again for that context, across
//! any number of invocations. When the execution budget runs out (or chunking
//! is forced) the loop stops at an item boundary and returns
//! [`LoopOutcome::Suspended`]; calling `run` again with the same context
//! picks up after the last committed item.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::budget::ExecutionBudget;
use super::context::ExecutionContext;
use super::continuation::Continuation;
use super::error::{ItemError, LoopError};
use crate::state::CheckpointTracker;

pub const DEFAULT_MAX_ERROR_ATTEMPTS: u32 = 2;

/// Skip reason recorded when an item has used up its error attempts.
pub const MAX_ATTEMPTS_REASON: &str = "Max error attempts reached";

/// What a per-item operation did with its item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome<R> {
    /// The item is done; `R` replaces the accumulated result.
    Done(R),
    /// Nothing to do for this item. It is neither committed nor counted.
    Continue,
}

/// Work applied to each item of a loop.
///
/// The operation owns whatever working state it needs across items. State
/// that must survive a suspension is exposed through [`backup`] and put back
/// through [`restore`] before the next invocation starts iterating.
///
/// [`backup`]: ItemOperation::backup
/// [`restore`]: ItemOperation::restore
#[async_trait]
pub trait ItemOperation<V: Send>: Send {
    /// Accumulated result threaded through the loop and persisted after
    /// every committed item.
    type Acc: Serialize + DeserializeOwned + Default + Clone + Send + Sync;

    async fn process(
        &mut self,
        key: &str,
        value: V,
        acc: Self::Acc,
    ) -> Result<ItemOutcome<Self::Acc>, ItemError>;

    fn backup(&self) -> Option<Value> {
        None
    }

    fn restore(&mut self, _snapshot: Value) -> Result<(), serde_json::Error> {
        Ok(())
    }
}

/// Per-session loop behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPolicy {
    /// Record skippable failures and move on instead of aborting.
    pub skip_on_error: bool,
    /// Failures an item may accumulate before it is skipped for good.
    pub max_error_attempts: u32,
    /// Suspend after every committed item that is not the last.
    pub force_chunking: bool,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            skip_on_error: false,
            max_error_attempts: DEFAULT_MAX_ERROR_ATTEMPTS,
            force_chunking: false,
        }
    }
}

/// How a loop invocation ended.
#[derive(Debug)]
pub enum LoopOutcome<R> {
    Completed(R),
    Suspended(Continuation),
}

impl<R> LoopOutcome<R> {
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }
}

#[derive(Debug, Clone)]
pub struct LoopExecutor {
    tracker: CheckpointTracker,
    policy: LoopPolicy,
    budget: ExecutionBudget,
    name: String,
}

impl LoopExecutor {
    pub fn new(tracker: CheckpointTracker, policy: LoopPolicy, budget: ExecutionBudget) -> Self {
        Self {
            tracker,
            policy,
            budget,
            name: "loop".to_string(),
        }
    }

    /// Name reported in continuations.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn tracker(&self) -> &CheckpointTracker {
        &self.tracker
    }

    pub fn policy(&self) -> &LoopPolicy {
        &self.policy
    }

    pub fn budget(&self) -> &ExecutionBudget {
        &self.budget
    }

    /// Iterate `items` under `context`.
    ///
    /// Item keys must be unique within the collection.
    pub async fn run<V, Op>(
        &self,
        context: &ExecutionContext,
        items: Vec<(String, V)>,
        op: &mut Op,
    ) -> Result<LoopOutcome<Op::Acc>, LoopError>
    where
        V: Send,
        Op: ItemOperation<V>,
    {
        let ctx = context.as_str();
        let tracker = &self.tracker;

        let mut acc: Op::Acc = tracker.get_result(ctx).await?.unwrap_or_default();

        if let Some(snapshot) = tracker.restore_state(ctx).await? {
            op.restore(snapshot).map_err(|source| LoopError::Restore {
                context: ctx.to_string(),
                source,
            })?;
            tracing::debug!(context = %ctx, "Restored backed-up state");
        }

        let mut processed: HashSet<String> = tracker.processed_keys(ctx).await?.into_iter().collect();
        tracing::debug!(
            context = %ctx,
            total = items.len(),
            already_processed = processed.len(),
            "Starting loop"
        );

        let mut items = items.into_iter().peekable();
        while let Some((key, value)) = items.next() {
            if processed.contains(&key) {
                continue;
            }

            if self.policy.skip_on_error {
                let attempts = tracker.error_attempts(ctx, &key).await?;
                if attempts >= self.policy.max_error_attempts {
                    tracker.mark_skipped(ctx, &key, MAX_ATTEMPTS_REASON).await?;
                    // Also committed, so the cap-skip is recorded and counted
                    // once instead of again on every re-invocation.
                    tracker.mark_processed(ctx, &key).await?;
                    processed.insert(key.clone());
                    let skips = tracker.increment_consecutive_skips().await?;
                    tracing::warn!(
                        context = %ctx,
                        key = %key,
                        attempts,
                        consecutive_skips = skips,
                        "Skipping item after repeated failures"
                    );
                    continue;
                }
            }

            match op.process(&key, value, acc.clone()).await {
                Ok(ItemOutcome::Continue) => {
                    tracing::debug!(context = %ctx, key = %key, "Nothing to do for item");
                    continue;
                }
                Ok(ItemOutcome::Done(next)) => {
                    acc = next;
                    if self.policy.skip_on_error {
                        tracker.reset_consecutive_skips().await?;
                    }
                }
                Err(ItemError::Skippable { kind, message, .. }) => {
                    if !self.policy.skip_on_error {
                        return Err(LoopError::SkipDisabled {
                            context: ctx.to_string(),
                            key,
                            kind,
                            message,
                        });
                    }
                    self.save_snapshot(ctx, op.backup()).await?;
                    let attempts = tracker.increment_error_attempts(ctx, &key).await?;
                    tracker.mark_skipped(ctx, &key, &message).await?;
                    tracing::warn!(
                        context = %ctx,
                        key = %key,
                        kind = %kind,
                        attempts,
                        "Item failed, skipping for now: {message}"
                    );
                    continue;
                }
                Err(ItemError::Fatal(error)) => {
                    if self.policy.skip_on_error {
                        tracker.increment_error_attempts(ctx, &key).await?;
                    }
                    tracing::error!(context = %ctx, key = %key, "Item failed: {error:#}");
                    return Err(LoopError::Item {
                        context: ctx.to_string(),
                        key,
                        error,
                    });
                }
            }

            // Snapshot before commit: a committed key always has its working
            // state persisted, even if the invocation dies right after.
            self.save_snapshot(ctx, op.backup()).await?;
            tracker.mark_processed(ctx, &key).await?;
            tracker.set_result(ctx, &acc).await?;
            processed.insert(key);

            let Some(next_key) = items.peek().map(|(k, _)| k.clone()) else {
                break;
            };
            if self.policy.force_chunking || self.budget.should_exit() {
                tracing::info!(
                    context = %ctx,
                    next = %next_key,
                    elapsed_ms = self.budget.elapsed().as_millis() as u64,
                    "Suspending loop"
                );
                return Ok(LoopOutcome::Suspended(Continuation {
                    session_id: tracker.session_id().to_string(),
                    context: ctx.to_string(),
                    next_hint: Some(next_key),
                    name: self.name.clone(),
                }));
            }
        }

        tracing::debug!(context = %ctx, "Loop completed");
        Ok(LoopOutcome::Completed(acc))
    }

    async fn save_snapshot(&self, ctx: &str, snapshot: Option<Value>) -> Result<(), LoopError> {
        if let Some(snapshot) = snapshot {
            self.tracker.backup_state(ctx, snapshot).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SessionStore, SqliteSessionStore};
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn store() -> Arc<dyn SessionStore> {
        Arc::new(SqliteSessionStore::open_in_memory().unwrap())
    }

    fn executor(store: &Arc<dyn SessionStore>, session: &str, policy: LoopPolicy) -> LoopExecutor {
        LoopExecutor::new(
            CheckpointTracker::new(store.clone(), session),
            policy,
            ExecutionBudget::unlimited(),
        )
    }

    fn chunked() -> LoopPolicy {
        LoopPolicy {
            force_chunking: true,
            ..LoopPolicy::default()
        }
    }

    fn skipping() -> LoopPolicy {
        LoopPolicy {
            skip_on_error: true,
            ..LoopPolicy::default()
        }
    }

    fn letters(n: usize) -> Vec<(String, String)> {
        (1..=n)
            .map(|i| (i.to_string(), char::from(b'a' + (i - 1) as u8).to_string()))
            .collect()
    }

    /// Appends each value; counts items seen across suspensions.
    #[derive(Default)]
    struct Collect {
        calls: Vec<String>,
        seen: u32,
        soft_skip: HashSet<String>,
        fail_on: Option<String>,
    }

    #[derive(Serialize, Deserialize)]
    struct CollectSnapshot {
        seen: u32,
    }

    #[async_trait]
    impl ItemOperation<String> for Collect {
        type Acc = Vec<String>;

        async fn process(
            &mut self,
            key: &str,
            value: String,
            mut acc: Vec<String>,
        ) -> Result<ItemOutcome<Vec<String>>, ItemError> {
            self.calls.push(key.to_string());
            if self.fail_on.as_deref() == Some(key) {
                return Err(ItemError::Fatal(anyhow::anyhow!("connection reset")));
            }
            if self.soft_skip.contains(key) {
                return Ok(ItemOutcome::Continue);
            }
            self.seen += 1;
            acc.push(value);
            Ok(ItemOutcome::Done(acc))
        }

        fn backup(&self) -> Option<Value> {
            serde_json::to_value(CollectSnapshot { seen: self.seen }).ok()
        }

        fn restore(&mut self, snapshot: Value) -> Result<(), serde_json::Error> {
            let snapshot: CollectSnapshot = serde_json::from_value(snapshot)?;
            self.seen = snapshot.seen;
            Ok(())
        }
    }

    /// Counts successes; keys in `failing` raise the configured error.
    #[derive(Default)]
    struct Flaky {
        calls: HashMap<String, u32>,
        failing: HashSet<String>,
        fatal: bool,
    }

    #[async_trait]
    impl ItemOperation<()> for Flaky {
        type Acc = u32;

        async fn process(&mut self, key: &str, _value: (), acc: u32) -> Result<ItemOutcome<u32>, ItemError> {
            *self.calls.entry(key.to_string()).or_default() += 1;
            if self.failing.contains(key) {
                if self.fatal {
                    return Err(ItemError::Fatal(anyhow::anyhow!("disk full")));
                }
                return Err(ItemError::skippable(key, "post", "boom"));
            }
            Ok(ItemOutcome::Done(acc + 1))
        }
    }

    fn flaky(failing: &[&str]) -> Flaky {
        Flaky {
            failing: failing.iter().map(|s| s.to_string()).collect(),
            ..Flaky::default()
        }
    }

    fn units(keys: &[&str]) -> Vec<(String, ())> {
        keys.iter().map(|k| (k.to_string(), ())).collect()
    }

    #[tokio::test]
    async fn test_uninterrupted_run_completes() {
        let store = store();
        let exec = executor(&store, "S1", LoopPolicy::default());
        let mut op = Collect::default();
        let out = exec
            .run(&ExecutionContext::new("t"), letters(3), &mut op)
            .await
            .unwrap();
        let LoopOutcome::Completed(acc) = out else {
            panic!("expected completion");
        };
        assert_eq!(acc, vec!["a", "b", "c"]);
        assert_eq!(op.calls, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_processed_keys_are_never_reprocessed() {
        let store = store();
        let exec = executor(&store, "S1", LoopPolicy::default());
        let ctx = ExecutionContext::new("t");

        let mut first = Collect::default();
        exec.run(&ctx, letters(3), &mut first).await.unwrap();

        let mut second = Collect::default();
        let out = exec.run(&ctx, letters(3), &mut second).await.unwrap();
        assert!(second.calls.is_empty());
        let LoopOutcome::Completed(acc) = out else {
            panic!("expected completion");
        };
        assert_eq!(acc, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_chunked_session_resumes_one_item_per_call() {
        let store = store();
        let exec = executor(&store, "S1", chunked());
        let ctx = ExecutionContext::new("t");

        let mut op = Collect::default();
        let out = exec.run(&ctx, letters(3), &mut op).await.unwrap();
        let LoopOutcome::Suspended(c) = out else {
            panic!("expected suspension");
        };
        assert_eq!(op.calls, vec!["1"]);
        assert_eq!(c.session_id, "S1");
        assert_eq!(c.context, "t");
        assert_eq!(c.next_hint.as_deref(), Some("2"));

        let mut op = Collect::default();
        let out = exec.run(&ctx, letters(3), &mut op).await.unwrap();
        assert!(out.is_suspended());
        assert_eq!(op.calls, vec!["2"]);
        assert_eq!(op.seen, 2);

        let mut op = Collect::default();
        let out = exec.run(&ctx, letters(3), &mut op).await.unwrap();
        assert_eq!(op.calls, vec!["3"]);
        assert_eq!(op.seen, 3);
        let LoopOutcome::Completed(chunked_acc) = out else {
            panic!("expected completion");
        };

        let other = executor(&store, "S2", LoopPolicy::default());
        let LoopOutcome::Completed(straight_acc) = other
            .run(&ctx, letters(3), &mut Collect::default())
            .await
            .unwrap()
        else {
            panic!("expected completion");
        };
        assert_eq!(chunked_acc, straight_acc);
    }

    #[tokio::test]
    async fn test_suspend_after_every_item_matches_uninterrupted() {
        let store = store();
        let ctx = ExecutionContext::new("t");
        let exec = executor(&store, "chunked", chunked());

        let mut invocations = 0;
        let chunked_acc = loop {
            invocations += 1;
            let mut op = Collect::default();
            match exec.run(&ctx, letters(6), &mut op).await.unwrap() {
                LoopOutcome::Completed(acc) => break acc,
                LoopOutcome::Suspended(_) => assert_eq!(op.calls.len(), 1),
            }
        };
        assert_eq!(invocations, 6);

        let straight = executor(&store, "straight", LoopPolicy::default());
        let LoopOutcome::Completed(straight_acc) = straight
            .run(&ctx, letters(6), &mut Collect::default())
            .await
            .unwrap()
        else {
            panic!("expected completion");
        };
        assert_eq!(chunked_acc, straight_acc);
    }

    #[tokio::test]
    async fn test_last_item_never_suspends() {
        let store = store();
        let exec = executor(&store, "S1", chunked());
        let out = exec
            .run(&ExecutionContext::new("t"), letters(1), &mut Collect::default())
            .await
            .unwrap();
        assert!(!out.is_suspended());
    }

    #[tokio::test]
    async fn test_suspension_backs_up_operation_state() {
        let store = store();
        let exec = executor(&store, "S1", chunked());
        let ctx = ExecutionContext::new("t");
        exec.run(&ctx, letters(3), &mut Collect::default()).await.unwrap();
        assert_eq!(
            exec.tracker().restore_state("t").await.unwrap(),
            Some(json!({"seen": 1}))
        );
    }

    #[tokio::test]
    async fn test_fatal_failure_keeps_state_of_committed_items() {
        let store = store();
        let exec = executor(&store, "S1", LoopPolicy::default());
        let ctx = ExecutionContext::new("t");
        let mut crashing = Collect {
            fail_on: Some("2".to_string()),
            ..Collect::default()
        };
        let result = exec.run(&ctx, letters(3), &mut crashing).await;
        assert!(matches!(result, Err(LoopError::Item { ref key, .. }) if key == "2"));
        assert_eq!(
            exec.tracker().restore_state("t").await.unwrap(),
            Some(json!({"seen": 1}))
        );

        let mut op = Collect::default();
        let out = exec.run(&ctx, letters(3), &mut op).await.unwrap();
        let LoopOutcome::Completed(result) = out else {
            panic!("expected completion");
        };
        assert_eq!(op.calls, vec!["2", "3"]);
        assert_eq!(op.seen, 3);
        assert_eq!(result, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_cancelled_budget_suspends_after_first_item() {
        let store = store();
        let token = CancellationToken::new();
        token.cancel();
        let exec = LoopExecutor::new(
            CheckpointTracker::new(store.clone(), "S1"),
            LoopPolicy::default(),
            ExecutionBudget::new(Some(Duration::from_secs(3600)), token),
        )
        .with_name("import");

        let mut op = Collect::default();
        let out = exec.run(&ExecutionContext::new("t"), letters(3), &mut op).await.unwrap();
        let LoopOutcome::Suspended(c) = out else {
            panic!("expected suspension");
        };
        assert_eq!(c.name, "import");
        assert_eq!(op.calls, vec!["1"]);
    }

    #[tokio::test]
    async fn test_soft_continue_leaves_item_uncommitted() {
        let store = store();
        let exec = executor(&store, "S1", LoopPolicy::default());
        let mut op = Collect {
            soft_skip: ["2".to_string()].into_iter().collect(),
            ..Collect::default()
        };
        let out = exec.run(&ExecutionContext::new("t"), letters(3), &mut op).await.unwrap();
        let LoopOutcome::Completed(acc) = out else {
            panic!("expected completion");
        };
        assert_eq!(acc, vec!["a", "c"]);
        assert_eq!(exec.tracker().processed_keys("t").await.unwrap(), vec!["1", "3"]);
    }

    #[tokio::test]
    async fn test_skippable_failure_is_bounded_then_skipped() {
        let store = store();
        let exec = executor(&store, "S1", skipping());
        let ctx = ExecutionContext::new("a");
        let tracker = exec.tracker().clone();
        let mut op = flaky(&["bad"]);

        // Two attempts, each recorded and left unprocessed.
        for expected in 1..=2 {
            let out = exec.run(&ctx, units(&["bad"]), &mut op).await.unwrap();
            assert!(!out.is_suspended());
            assert_eq!(op.calls["bad"], expected);
            assert_eq!(tracker.error_attempts("a", "bad").await.unwrap(), expected);
            assert!(!tracker.is_processed("a", "bad").await.unwrap());
        }
        assert_eq!(tracker.consecutive_skips().await.unwrap(), 0);

        // Third invocation skips without calling the operation.
        exec.run(&ctx, units(&["bad"]), &mut op).await.unwrap();
        assert_eq!(op.calls["bad"], 2);
        assert_eq!(tracker.consecutive_skips().await.unwrap(), 1);
        let skipped = tracker.skipped_items().await.unwrap();
        assert_eq!(skipped.len(), 3);
        assert_eq!(skipped[0].reason, "boom");
        assert_eq!(skipped[2].reason, MAX_ATTEMPTS_REASON);

        // Permanently skipped: further invocations neither call nor count it.
        exec.run(&ctx, units(&["bad"]), &mut op).await.unwrap();
        assert_eq!(op.calls["bad"], 2);
        assert_eq!(tracker.consecutive_skips().await.unwrap(), 1);

        // Any later success resets the session-wide counter.
        exec.run(&ExecutionContext::new("b"), units(&["ok"]), &mut op)
            .await
            .unwrap();
        assert_eq!(tracker.consecutive_skips().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_skippable_failure_continues_with_next_item() {
        let store = store();
        let exec = executor(&store, "S1", skipping());
        let mut op = flaky(&["2"]);
        let out = exec
            .run(&ExecutionContext::new("t"), units(&["1", "2", "3"]), &mut op)
            .await
            .unwrap();
        let LoopOutcome::Completed(acc) = out else {
            panic!("expected completion");
        };
        assert_eq!(acc, 2);
        assert!(exec.tracker().is_skipped("t", "2").await.unwrap());
    }

    #[tokio::test]
    async fn test_skippable_failure_is_fatal_when_skipping_disabled() {
        let store = store();
        let exec = executor(&store, "S1", LoopPolicy::default());
        let result = exec
            .run(&ExecutionContext::new("t"), units(&["1", "2"]), &mut flaky(&["1"]))
            .await;
        assert!(matches!(result, Err(LoopError::SkipDisabled { ref key, .. }) if key == "1"));
        assert!(!exec.tracker().is_processed("t", "1").await.unwrap());
        assert_eq!(exec.tracker().error_attempts("t", "1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fatal_failure_counts_attempt_and_propagates() {
        let store = store();
        let exec = executor(&store, "S1", skipping());
        let mut op = Flaky {
            fatal: true,
            ..flaky(&["1"])
        };
        let result = exec.run(&ExecutionContext::new("t"), units(&["1", "2"]), &mut op).await;
        assert!(matches!(result, Err(LoopError::Item { .. })));
        assert_eq!(exec.tracker().error_attempts("t", "1").await.unwrap(), 1);
        assert!(!op.calls.contains_key("2"));
    }

    #[tokio::test]
    async fn test_contexts_keep_separate_progress() {
        let store = store();
        let exec = executor(&store, "S1", LoopPolicy::default());
        exec.run(&ExecutionContext::new("x"), letters(2), &mut Collect::default())
            .await
            .unwrap();
        let mut op = Collect::default();
        exec.run(&ExecutionContext::new("y"), letters(2), &mut op).await.unwrap();
        assert_eq!(op.calls, vec!["1", "2"]);
    }
}
