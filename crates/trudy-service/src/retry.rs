//! Exponential backoff for outbound HTTP calls.
//!
//! Used by the Ultravox client for every request and by the egress worker to
//! space delivery attempts.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Errors that may succeed when retried.
pub trait Transient {
    /// Whether the failure is worth another attempt (timeouts, connection
    /// failures, 429 and 5xx answers).
    fn is_transient(&self) -> bool;
}

/// Backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay.
    pub max_delay: Duration,
    /// Upper bound on jitter as a fraction of the delay.
    pub max_jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Default schedule with a different attempt budget.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay after failed attempt number `attempt` (1-based), before jitter.
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Delay after failed attempt number `attempt`, with uniform jitter in
    /// `[0, max_jitter]` of the base delay added.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        let jitter = if self.max_jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.max_jitter)
        } else {
            0.0
        };
        base + base.mul_f64(jitter)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent. The last error is returned on exhaustion.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts && e.is_transient() => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        transient: bool,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "transient={}", self.transient)
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.base_delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.base_delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.base_delay_for(6), Duration::from_secs(10));
        assert_eq!(policy.base_delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_thirty_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1300));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&RetryPolicy::default(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TestError { transient: true })
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError { transient: false }) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            retry_with_backoff(&RetryPolicy::with_max_attempts(3), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { transient: true }) }
            })
            .await;

        assert!(result.unwrap_err().transient);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
