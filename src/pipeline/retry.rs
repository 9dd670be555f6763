use etl_core::{CancellationSignal, EtlError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::observability::metrics;

/// How often a failing stage `execute` is attempted, and the pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis().min(u128::from(u64::MAX)) as u64,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Run `operation` until it succeeds, fails with cancellation, or attempts run out.
///
/// Returns the final outcome with the number of attempts made. The delay
/// between attempts is cut short by cancellation.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationSignal,
    stage_id: &str,
    mut operation: F,
) -> (Result<T>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) if !err.is_cancellation() && attempt < max_attempts => {
                warn!(
                    stage_id,
                    attempt,
                    max_attempts,
                    delay_ms = policy.delay_ms,
                    error = %err,
                    "🔁 Stage attempt failed, will retry"
                );
                metrics::stage::retried(stage_id);
                tokio::select! {
                    _ = tokio::time::sleep(policy.delay()) => {}
                    _ = cancel.cancelled() => return (Err(EtlError::Cancelled), attempt),
                }
            }
            Err(err) => {
                if !err.is_cancellation() && max_attempts > 1 {
                    error!(stage_id, attempt, max_attempts, "Max retries exhausted");
                }
                return (Err(err), attempt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_retries_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let cancel = CancellationSignal::new();
        let (result, attempts) = retry_with_policy(&policy, &cancel, "s", |attempt| async move {
            if attempt < 3 {
                Err(EtlError::validation("flaky"))
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let cancel = CancellationSignal::new();
        let (result, attempts) =
            retry_with_policy(&policy, &cancel, "s", |_| async { Err::<(), _>(EtlError::validation("down")) }).await;
        assert!(result.is_err());
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_retried() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let cancel = CancellationSignal::new();
        let (result, attempts) =
            retry_with_policy(&policy, &cancel, "s", |_| async { Err::<(), _>(EtlError::Cancelled) }).await;
        assert!(result.unwrap_err().is_cancellation());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_policy_defaults_to_single_attempt() {
        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.max_attempts, 1);
    }
}
