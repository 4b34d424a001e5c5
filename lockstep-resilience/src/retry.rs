//! Retry policy and executor for contended operations
//!
//! Lock acquisition never gives up: an operation is retried for as long as it
//! reports contention, and any other failure is returned on the spot.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::backoff::{BackoffCalculator, BackoffStrategy};

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff strategy
    pub backoff_strategy: BackoffStrategy,

    /// Whether to add jitter to retry delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_strategy: BackoffStrategy::Fixed,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that waits the same interval between every attempt
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_strategy: BackoffStrategy::Fixed,
            jitter: false,
        }
    }

    /// Calculate delay for a specific attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.calculator().calculate_delay(attempt)
    }

    fn calculator(&self) -> BackoffCalculator {
        BackoffCalculator::new(
            self.backoff_strategy.clone(),
            self.initial_delay,
            self.max_delay,
            self.jitter,
        )
    }
}

/// Errors that can signal "someone else holds the resource, try again later"
pub trait Contention {
    /// Whether this error is contention rather than a real failure
    fn is_contention(&self) -> bool;
}

/// Retry executor
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create a new retry executor with the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `f` until it succeeds or fails with a non-contention error.
    ///
    /// `f` receives the 1-indexed attempt number. There is no attempt limit;
    /// callers that need a deadline must wrap the returned future in a timeout.
    pub async fn execute<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Contention + Display,
    {
        let calculator = self.policy.calculator();
        let mut attempt: u32 = 1;

        loop {
            match f(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        info!("Acquired after {} attempts", attempt);
                    }
                    return Ok(result);
                }
                Err(error) if error.is_contention() => {
                    let delay = calculator.calculate_delay(attempt);
                    debug!(
                        "Attempt {} contended: {}. Retrying in {:?}",
                        attempt, error, delay
                    );
                    sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    enum TestError {
        Busy,
        Broken(String),
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Busy => write!(f, "busy"),
                TestError::Broken(msg) => write!(f, "broken: {}", msg),
            }
        }
    }

    impl Contention for TestError {
        fn is_contention(&self) -> bool {
            matches!(self, TestError::Busy)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_contention_clears() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(Duration::from_millis(50)));
        let calls = Arc::new(AtomicU32::new(0));

        let started = tokio::time::Instant::now();
        let result: Result<&str, TestError> = executor
            .execute(|attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 4 {
                        Err(TestError::Busy)
                    } else {
                        Ok("acquired")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "acquired");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_contention_error_is_not_retried() {
        let executor = RetryExecutor::default();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), TestError> = executor
            .execute(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Broken("no such table".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(TestError::Broken(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contention_has_no_attempt_limit() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(Duration::from_millis(1)));

        let result: Result<u32, TestError> = executor
            .execute(|attempt| async move {
                if attempt < 1_000 {
                    Err(TestError::Busy)
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1_000);
    }

    #[test]
    fn test_policy_from_yaml() {
        let yaml = r#"
initial_delay: 250ms
max_delay: 2s
backoff_strategy:
  type: exponential
  base: 2.0
jitter: true
"#;
        let policy: RetryPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(2));
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Exponential { base: 2.0 });
        assert!(policy.jitter);
    }

    #[test]
    fn test_policy_defaults_to_fixed_interval() {
        let policy: RetryPolicy = serde_yaml::from_str("{}").unwrap();
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(100));
    }
}
