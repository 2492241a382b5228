//! Bounded retries with exponential backoff and jitter.
//!
//! Only errors for which [`AppError::is_retryable`] holds are retried. The
//! wait between attempts races the run's cancellation token; a cancelled
//! wait ends the loop with [`AppError::Cancelled`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Retry schedule for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub tries: u32,
    /// Delay after the first failed attempt.
    pub delay: Duration,
    /// Cap on the backed-off delay, applied before jitter.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff: f64,
    /// Upper bound of the uniform random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tries: 5,
            delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff: 1.5,
            jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            tries: 1,
            ..Self::default()
        }
    }

    /// Wait before the next attempt, after `failed` attempts (1-based) have failed.
    pub fn delay_for_attempt(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(64) as i32;
        let backed_off = self.delay.as_secs_f64() * self.backoff.powi(exponent);
        let capped = backed_off.min(self.max_delay.as_secs_f64());
        let capped = if capped.is_finite() {
            Duration::from_secs_f64(capped.max(0.0))
        } else {
            self.max_delay
        };
        capped + jitter(self.jitter)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// tries are used up. `op` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, AppError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let tries = self.tries.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < tries => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(
                        attempt,
                        tries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Call failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AppError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let secs = rand::rng().random_range(0.0..=max.as_secs_f64());
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn status(code: u16) -> AppError {
        AppError::HttpStatus {
            status: code,
            url: "http://example.com".into(),
        }
    }

    fn fast(tries: u32) -> RetryPolicy {
        RetryPolicy {
            tries,
            delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff: 2.0,
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs_f64(7.5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs_f64(11.25));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(60));
    }

    #[test]
    fn jitter_is_added_after_cap() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.delay_for_attempt(30);
            assert!(d >= Duration::from_secs(60));
            assert!(d <= Duration::from_secs(61));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let result = fast(5)
            .execute(&cancel, |attempt| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 { Err(status(503)) } else { Ok(attempt) }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let err = fast(3)
            .execute(&cancel, |attempt| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(status(500 + attempt as u16))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, AppError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_propagate_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let err = fast(5)
            .execute(&cancel, |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(AppError::HttpError("connection refused".into()))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, AppError::HttpError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            tries: 5,
            delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(3600),
            backoff: 1.0,
            jitter: Duration::ZERO,
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let err = policy
            .execute(&cancel, |_| async { Err::<(), _>(status(503)) })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn single_try_policy_does_not_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let _ = RetryPolicy::none()
            .execute(&cancel, |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(status(503))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
