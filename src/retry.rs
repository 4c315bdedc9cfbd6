//! Bounded exponential backoff for calls to the payment processor.
//!
//! Only errors reporting [`LedgerLinkError::is_retryable`] and timeouts are
//! retried. Once the budget is spent the call fails with
//! [`LedgerLinkError::RetryLimitExceeded`] instead of blocking.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::{LedgerLinkError, Result};

/// Retry budget for upstream lookups.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on the delay between attempts in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries. Useful in tests.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Run `operation_fn` until it succeeds, fails permanently, or the retry budget runs out.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    operation_fn: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let timeout_duration = Duration::from_secs(policy.timeout_seconds);
    let mut attempts = 0;

    loop {
        let last_error = match tokio::time::timeout(timeout_duration, operation_fn()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_retryable() => return Err(e),
            Ok(Err(e)) => e.to_string(),
            Err(_elapsed) => format!("timed out after {} seconds", policy.timeout_seconds),
        };

        if attempts >= policy.max_retries {
            tracing::error!(
                target: "ledgerlink::retry",
                operation = operation,
                attempts = attempts + 1,
                error = %last_error,
                "Upstream call failed, retry budget exhausted"
            );
            return Err(LedgerLinkError::RetryLimitExceeded {
                operation: operation.to_string(),
                attempts: attempts + 1,
                last_error,
            });
        }

        let delay = calculate_backoff_delay(attempts, policy.base_delay_ms, policy.max_delay_ms);
        tracing::warn!(
            target: "ledgerlink::retry",
            operation = operation,
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            error = %last_error,
            "Retrying upstream call after transient error"
        );
        tokio::time::sleep(delay).await;
        attempts += 1;
    }
}

/// Exponential backoff `base * 2^attempt`, capped at `max_ms`, plus 0-25% jitter.
#[inline]
pub(crate) fn calculate_backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let delay_ms = delay_ms.min(max_ms);

    let jitter = if delay_ms > 0 {
        fastrand::u64(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::default()
            .max_retries(max_retries)
            .base_delay_ms(1)
            .max_delay_ms(2)
    }

    #[test]
    fn test_backoff_is_capped() {
        for attempt in 0..10 {
            let delay = calculate_backoff_delay(attempt, 500, 30_000);
            // cap plus at most 25% jitter
            assert!(delay <= Duration::from_millis(37_500));
        }
        let first = calculate_backoff_delay(0, 500, 30_000);
        assert!(first >= Duration::from_millis(500));
        assert!(first <= Duration::from_millis(625));
    }

    #[test]
    fn test_backoff_zero_base() {
        assert_eq!(calculate_backoff_delay(3, 0, 1000), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(&fast_policy(3), "fetch_customer", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LedgerLinkError::upstream("fetch_customer", "HTTP 503"))
                } else {
                    Ok("cus_abc")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "cus_abc");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = with_retry(&fast_policy(3), "fetch_customer", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LedgerLinkError::not_found("customer", "cus_missing"))
            }
        })
        .await;

        assert!(matches!(result, Err(LedgerLinkError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let result: Result<()> = with_retry(&fast_policy(2), "fetch_customer", || async {
            Err(LedgerLinkError::upstream("fetch_customer", "HTTP 429"))
        })
        .await;

        match result {
            Err(LedgerLinkError::RetryLimitExceeded {
                operation,
                attempts,
                last_error,
            }) => {
                assert_eq!(operation, "fetch_customer");
                assert_eq!(attempts, 3);
                assert!(last_error.contains("HTTP 429"));
            }
            other => panic!("expected RetryLimitExceeded, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_retryable() {
        let policy = fast_policy(1).timeout_seconds(1);
        let result: Result<()> = with_retry(&policy, "fetch_customer", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(LedgerLinkError::RetryLimitExceeded { attempts, last_error, .. }) => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("expected RetryLimitExceeded, got {:?}", other),
        }
    }
}
