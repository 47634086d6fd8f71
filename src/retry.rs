use std::future::Future;
use std::time::Duration;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Fixed-attempt retry configuration.
///
/// Attempts are bounded by a constant count and separated by a constant
/// delay (zero by default).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::ZERO,
        }
    }
}

impl RetryConfig {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }
}

/// Retry an async operation a fixed number of times.
///
/// - `config`: retry configuration
/// - `classifier`: inspects an error and returns `Retry` or `Abort`
/// - `operation`: the async closure to retry
///
/// Returns the first `Ok` result, or the last error if attempts are
/// exhausted or the classifier returns `Abort`.
pub async fn retry_fixed<F, Fut, T, E, C>(
    config: &RetryConfig,
    classifier: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let total_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if classifier(&e) == RetryAction::Abort || attempt >= total_attempts {
                    return Err(e);
                }
                tracing::warn!(
                    "Retryable error (attempt {}/{}): {}",
                    attempt,
                    total_attempts,
                    e
                );
                if !config.delay.is_zero() {
                    tokio::time::sleep(config.delay).await;
                }
                attempt += 1;
            }
        }
    }
}
