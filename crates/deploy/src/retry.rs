//! Timeouts and bounded retries for network-facing steps.

use std::{future::Future, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};

use crate::DeployError;

/// Default time a single network call may take.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default delay before the first retry.
const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(500);

/// Default cap on the delay between retries.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// How network-facing steps are timed out and retried.
///
/// Only [`DeployError::NetworkTimeout`] is retried; reverts and validation
/// errors fail immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Time budget of a single attempt.
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: usize,
    #[serde(with = "duration_millis")]
    pub min_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_retries: 3,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits between attempts, for tests and dev chains.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_retries,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
    }

    /// Run `step` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. Each attempt is bounded by `call_timeout`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut step: F) -> Result<T, DeployError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DeployError>>,
    {
        let mut attempts = 0usize;

        let attempt = || {
            attempts += 1;
            let fut = step();
            async move {
                match tokio::time::timeout(self.call_timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(DeployError::NetworkTimeout {
                        operation: operation.to_string(),
                        attempts: 1,
                    }),
                }
            }
        };

        let result = attempt
            .retry(self.backoff())
            .sleep(tokio::time::sleep)
            .when(DeployError::is_retryable)
            .notify(|err, delay| {
                tracing::warn!(operation, error = %err, ?delay, "Retrying after network timeout");
            })
            .await;

        result.map_err(|err| match err {
            DeployError::NetworkTimeout { operation, .. } => {
                DeployError::NetworkTimeout { operation, attempts }
            }
            other => other,
        })
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn timeout() -> DeployError {
        DeployError::NetworkTimeout {
            operation: "deploy Oracle".to_string(),
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn test_retries_timeouts_until_success() {
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let result = RetryPolicy::immediate(3)
            .run("deploy Oracle", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(timeout())
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_budget_reports_attempts() {
        let result: Result<(), _> = RetryPolicy::immediate(2)
            .run("deploy Oracle", || async { Err(timeout()) })
            .await;

        match result {
            Err(DeployError::NetworkTimeout { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected a network timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reverts_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let result: Result<(), _> = RetryPolicy::immediate(5)
            .run("deploy Oracle", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DeployError::Revert {
                    operation: "deploy Oracle".to_string(),
                    reason: "out of gas".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(DeployError::Revert { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_step_times_out() {
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(50),
            ..RetryPolicy::immediate(0)
        };

        let result = policy
            .run("call priceOracle", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(DeployError::NetworkTimeout { .. })));
    }
}
