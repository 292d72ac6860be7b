use std::future::Future;
use std::time::Duration;

use crate::config::RetryOptions;

/// Errors that can tell the retry loop whether another attempt is worthwhile.
pub trait Retryable {
    /// HTTP-like status code carried by the error, if any.
    fn status(&self) -> Option<u16>;

    /// Client rejections (4xx other than 429) cannot change on retry.
    fn is_permanent(&self) -> bool {
        matches!(self.status(), Some(code) if (400..500).contains(&code) && code != 429)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            backoff: 2.0,
        }
    }
}

impl From<&RetryOptions> for RetryPolicy {
    fn from(options: &RetryOptions) -> Self {
        Self {
            max_attempts: options.max_attempts,
            initial_delay: Duration::from_millis(options.initial_delay_ms),
            backoff: options.backoff,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries without sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            backoff: 1.0,
        }
    }

    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_observed(|_, _| {}, op).await
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempt ceiling
    /// is reached. `on_retry` sees each transient failure and the 1-based
    /// attempt number before the backoff sleep.
    pub async fn run_observed<T, E, F, Fut, O>(&self, mut on_retry: O, mut op: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        O: FnMut(&E, u32),
    {
        let attempts = self.max_attempts.max(1);
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if err.is_permanent() || attempt >= attempts {
                return Err(err);
            }
            on_retry(&err, attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            delay = delay.mul_f64(self.backoff.max(0.0));
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    struct Failure(Option<u16>);

    impl Retryable for Failure {
        fn status(&self) -> Option<u16> {
            self.0
        }
    }

    #[tokio::test]
    async fn transient_failures_exhaust_the_attempt_ceiling() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);
        let result: Result<(), Failure> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure(Some(503))) }
            })
            .await;
        assert_eq!(result, Err(Failure(Some(503))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_is_attempted_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);
        let result: Result<(), Failure> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure(Some(404))) }
            })
            .await;
        assert_eq!(result, Err(Failure(Some(404))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limits_and_statusless_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(4);
        let result = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => Err(Failure(Some(429))),
                        1 => Err(Failure(None)),
                        _ => Ok("done"),
                    }
                }
            })
            .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn observer_sees_each_retry_but_not_the_final_failure() {
        let mut seen = Vec::new();
        let policy = RetryPolicy::immediate(3);
        let _ = policy
            .run_observed(
                |err: &Failure, attempt| seen.push((err.0, attempt)),
                || async { Err::<(), _>(Failure(Some(500))) },
            )
            .await;
        assert_eq!(seen, vec![(Some(500), 1), (Some(500), 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_grows_by_the_backoff_factor() {
        let started = tokio::time::Instant::now();
        let policy = RetryPolicy::default();
        let _ = policy
            .run(|| async { Err::<(), _>(Failure(None)) })
            .await;
        // 1000ms after the first failure, 2000ms after the second.
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
    }

    #[test]
    fn permanent_classification_spares_429() {
        assert!(Failure(Some(400)).is_permanent());
        assert!(Failure(Some(499)).is_permanent());
        assert!(!Failure(Some(429)).is_permanent());
        assert!(!Failure(Some(500)).is_permanent());
        assert!(!Failure(None).is_permanent());
    }
}
