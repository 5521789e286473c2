//! Exponential backoff for transient provider failures.

use super::ProviderError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff policy: delay_n = min(cap, base · 2^(n−1)), honoring any
/// server-supplied retry-after hint as a floor.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1500),
            cap: Duration::from_secs(15),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_ms: u64, cap_ms: u64, max_attempts: u32) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Backoff delay before attempt `n + 1` (so `attempt` is the 1-based
    /// number of the attempt that just failed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.cap)
    }

    /// Run `op` until it succeeds, fails non-transiently, or exhausts the
    /// attempt budget. The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> Result<T, ProviderError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let mut delay = self.backoff_delay(attempt);
                    if let Some(hint) = err.retry_after() {
                        // A 429 hint is authoritative: wait at least that long.
                        delay = delay.max(hint);
                    }
                    debug!(
                        "{label}: attempt {attempt}/{} failed ({err}), retrying in {:?}",
                        self.max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!("{label}: giving up after {attempt} attempts: {err}");
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_progression() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(1500));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(3000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(6000));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(12000));
        // capped
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(15));
        assert_eq!(policy.backoff_delay(12), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let policy = RetryPolicy::new(10, 100, 5);
        let calls = AtomicU32::new(0);

        let result = policy
            .run("test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(ProviderError::Network("reset".to_string()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_fails_fast() {
        let policy = RetryPolicy::new(10, 100, 5);
        let calls = AtomicU32::new(0);

        let err = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(ProviderError::Http {
                        status: 404,
                        body: String::new(),
                        retry_after: None,
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(err.is_stale_url());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempt_budget() {
        let policy = RetryPolicy::new(1, 10, 3);
        let calls = AtomicU32::new(0);

        let err = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(ProviderError::Http {
                        status: 503,
                        body: String::new(),
                        retry_after: None,
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_floor() {
        let policy = RetryPolicy::new(10, 30_000, 2);
        let started = tokio::time::Instant::now();

        let _ = policy
            .run("test", |attempt| async move {
                if attempt == 1 {
                    Err::<(), _>(ProviderError::Http {
                        status: 429,
                        body: String::new(),
                        retry_after: Some(Duration::from_secs(5)),
                    })
                } else {
                    Ok(())
                }
            })
            .await;

        // slept at least the hinted 5s, not the 10ms backoff
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
