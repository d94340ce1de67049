use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::sync::SyncConfiguration;

/// Backoff delays are spread by up to this fraction in either direction so
/// concurrent workers do not retry in lockstep.
const JITTER_FRACTION: f64 = 0.2;

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, rate limits, 5xx responses, write conflicts.
    Transient,
    /// Malformed records, validation rejections, auth failures.
    Permanent,
}

pub trait Classify {
    fn class(&self) -> ErrorClass;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    fn stop() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Result of running an operation under the policy.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Retries consumed (attempts beyond the first).
    pub retries: u32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            backoff_multiplier: backoff_multiplier.max(1.0),
            jitter: JITTER_FRACTION,
        }
    }

    pub fn from_config(config: &SyncConfiguration) -> Self {
        Self::new(
            config.retry.max_retries,
            config.initial_delay(),
            config.max_delay(),
            config.retry.backoff_multiplier,
        )
    }

    /// Un-jittered delay before retry number `attempt` (1-based):
    /// `min(max_delay, initial_delay * multiplier^(attempt-1))`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let initial_ms = self.initial_delay.as_secs_f64() * 1_000.0;
        let delay_ms = initial_ms * self.backoff_multiplier.powi(exponent);
        let max_ms = self.max_delay.as_secs_f64() * 1_000.0;
        if !delay_ms.is_finite() || delay_ms >= max_ms {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_ms / 1_000.0)
    }

    /// Decide what to do after failed attempt number `attempt` (1-based).
    ///
    /// Permanent errors never retry. Transient errors retry while
    /// `attempt <= max_retries`.
    pub fn should_retry<E: Classify>(&self, attempt: u32, error: &E) -> RetryDecision {
        if error.class() == ErrorClass::Permanent || attempt > self.max_retries {
            return RetryDecision::stop();
        }
        RetryDecision {
            retry: true,
            delay: self.jittered(self.backoff_delay(attempt)),
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + (fastrand::f64() * 2.0 - 1.0) * self.jitter;
        delay.mul_f64(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    /// `label` names the operation in log output.
    pub async fn run<F, Fut, T, E>(&self, label: &str, mut op: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(val) => {
                    return RetryOutcome {
                        result: Ok(val),
                        retries: attempt - 1,
                    }
                }
                Err(e) => {
                    let decision = self.should_retry(attempt, &e);
                    if !decision.retry {
                        return RetryOutcome {
                            result: Err(e),
                            retries: attempt - 1,
                        };
                    }
                    log::warn!(
                        "{label} failed: {e}. Waiting {:?} before retry {attempt}/{}",
                        decision.delay,
                        self.max_retries
                    );
                    tokio::time::sleep(decision.delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug)]
    struct TestError(ErrorClass);

    impl Classify for TestError {
        fn class(&self) -> ErrorClass {
            self.0
        }
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            3,
            Duration::from_millis(1_000),
            Duration::from_millis(30_000),
            2.0,
        )
    }

    #[test]
    fn test_backoff_delays() {
        let p = policy();
        assert_eq!(p.backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(p.backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(4_000));
        assert_eq!(p.backoff_delay(10), Duration::from_millis(30_000));
        assert_eq!(p.backoff_delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_should_retry_transient_until_exhausted() {
        let p = policy();
        let err = TestError(ErrorClass::Transient);
        for (attempt, expected_ms) in [(1, 1_000.0), (2, 2_000.0), (3, 4_000.0)] {
            let decision = p.should_retry(attempt, &err);
            assert!(decision.retry, "attempt {attempt} should retry");
            let ms = decision.delay.as_secs_f64() * 1_000.0;
            assert!(
                ms >= expected_ms * 0.8 - 1.0 && ms <= expected_ms * 1.2 + 1.0,
                "attempt {attempt}: {ms}ms outside jitter band of {expected_ms}ms"
            );
        }
        assert!(!p.should_retry(4, &err).retry);
    }

    #[test]
    fn test_permanent_never_retries() {
        let p = policy();
        let err = TestError(ErrorClass::Permanent);
        assert!(!p.should_retry(1, &err).retry);
        assert!(!p.should_retry(0, &err).retry);
    }

    #[test]
    fn test_zero_retries() {
        let p = RetryPolicy::new(0, Duration::from_millis(10), Duration::from_millis(10), 1.0);
        assert!(!p.should_retry(1, &TestError(ErrorClass::Transient)).retry);
    }

    #[test]
    fn test_jitter_capped_at_max_delay() {
        let p = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(100), 2.0);
        for _ in 0..100 {
            let d = p.should_retry(5, &TestError(ErrorClass::Transient)).delay;
            assert!(d <= Duration::from_millis(100));
            assert!(d >= Duration::from_millis(80));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_attempts_one_plus_max_retries() {
        let p = policy();
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let outcome: RetryOutcome<(), TestError> = p
            .run("test op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError(ErrorClass::Transient)) }
            })
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.retries, 3);
        // ~1s + ~2s + ~4s, each within ±20%
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(5_600));
        assert!(waited <= Duration::from_millis(8_400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_recovers_after_transient() {
        let p = policy();
        let calls = AtomicU32::new(0);

        let outcome = p
            .run("test op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError(ErrorClass::Transient))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), 2);
        assert_eq!(outcome.retries, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_permanent() {
        let p = policy();
        let calls = AtomicU32::new(0);

        let outcome: RetryOutcome<(), TestError> = p
            .run("test op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError(ErrorClass::Permanent)) }
            })
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.retries, 0);
    }
}
