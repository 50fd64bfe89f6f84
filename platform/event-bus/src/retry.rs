//! Bounded exponential backoff for transport sends
//!
//! The publisher retries each queue a few times in-process; anything still
//! failing goes back to the outbox sweep, which is the long-term retry.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt after that
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.initial_backoff > self.max_backoff {
            return Err("initial_backoff must not exceed max_backoff".to_string());
        }
        Ok(())
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// Run `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or `max_attempts` is used up. Returns the last error.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    context: &str,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(context = %context, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) || attempt >= max_attempts {
            tracing::warn!(
                context = %context,
                attempt,
                max_attempts,
                error = %err,
                "Giving up"
            );
            return Err(err);
        }

        let delay = config.backoff_after(attempt);
        tracing::warn!(
            context = %context,
            attempt,
            max_attempts,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, backing off"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };

        assert_eq!(config.backoff_after(1), Duration::from_millis(100));
        assert_eq!(config.backoff_after(2), Duration::from_millis(200));
        assert_eq!(config.backoff_after(3), Duration::from_millis(400));
        assert_eq!(config.backoff_after(4), Duration::from_millis(500));
        assert_eq!(config.backoff_after(64), Duration::from_millis(500));
    }

    #[test]
    fn test_validate() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig { max_attempts: 0, ..fast() }.validate().is_err());
        assert!(RetryConfig {
            initial_backoff: Duration::from_secs(1),
            ..fast()
        }
        .validate()
        .is_err());
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = retry_if(
            &fast(),
            "test",
            || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n}"))
                } else {
                    Ok(n)
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_returns_last_error_when_exhausted() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), String> = retry_if(
            &fast(),
            "test",
            || async move { Err(format!("attempt {}", calls.fetch_add(1, Ordering::SeqCst) + 1)) },
            |_| true,
        )
        .await;

        assert_eq!(result, Err("attempt 3".to_string()));
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), &str> = retry_if(
            &fast(),
            "test",
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("too large")
            },
            |e| *e != "too large",
        )
        .await;

        assert_eq!(result, Err("too large"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
