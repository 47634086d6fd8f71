use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// How long one invocation may keep iterating before it should suspend.
///
/// Exhausted either by wall-clock time or by cancellation of the shutdown
/// token, whichever comes first.
#[derive(Debug, Clone)]
pub struct ExecutionBudget {
    started: Instant,
    limit: Option<Duration>,
    token: CancellationToken,
}

impl ExecutionBudget {
    pub fn new(limit: Option<Duration>, token: CancellationToken) -> Self {
        Self {
            started: Instant::now(),
            limit,
            token,
        }
    }

    /// A budget that only ends on cancellation.
    pub fn unlimited() -> Self {
        Self::new(None, CancellationToken::new())
    }

    pub fn should_exit(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        self.limit.is_some_and(|limit| self.started.elapsed() >= limit)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for ExecutionBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_exits() {
        assert!(!ExecutionBudget::unlimited().should_exit());
    }

    #[test]
    fn test_zero_limit_exits_immediately() {
        let budget = ExecutionBudget::new(Some(Duration::ZERO), CancellationToken::new());
        assert!(budget.should_exit());
    }

    #[test]
    fn test_cancellation_exhausts_budget() {
        let token = CancellationToken::new();
        let budget = ExecutionBudget::new(Some(Duration::from_secs(3600)), token.clone());
        assert!(!budget.should_exit());
        token.cancel();
        assert!(budget.should_exit());
    }
}
