//! Retrying with exponential backoff.
//!
//! [`RetryPolicy::run`] drives an async operation until it succeeds, a
//! permanent error surfaces, the attempt budget runs out, or the caller
//! cancels. Backoff doubles from the initial delay up to the cap, and
//! the wait itself is cancellable.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::{ErrorClass, SmtpError, SmtpErrorKind, SmtpResult};

/// Default number of attempts, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default backoff ceiling.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default backoff multiplier.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Retry tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempt budget, including the first attempt.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Ceiling for the computed delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Factor applied to the delay after each failure.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the delay ceiling.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Executes operations under a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a policy from a configuration value.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Computes the delay after the given failed attempt (1-based):
    /// `initial * multiplier^(attempt - 1)`, capped at the ceiling.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        Duration::from_secs_f64(raw.min(self.config.max_delay.as_secs_f64()))
    }

    /// Runs `op` until it succeeds or retrying stops making sense.
    ///
    /// `op` receives the 1-based attempt number. `on_retry` fires after
    /// each failed attempt that will be retried, before the backoff
    /// sleep. Permanent errors stop the loop immediately; exhausting the
    /// budget yields an error naming the attempt count; cancellation is
    /// honored both between attempts and during the backoff sleep.
    pub async fn run<T, F, Fut, N>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        mut on_retry: N,
    ) -> SmtpResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SmtpResult<T>>,
        N: FnMut(u32, &SmtpError),
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1u32;

        loop {
            if cancel.is_cancelled() {
                return Err(SmtpError::cancelled());
            }

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            // Cancellation and a closed pool pass through unwrapped so
            // callers see the real condition, not a delivery failure.
            if matches!(
                err.kind(),
                SmtpErrorKind::Cancelled | SmtpErrorKind::PoolClosed
            ) {
                return Err(err);
            }
            if err.class() == ErrorClass::Permanent {
                return Err(SmtpError::permanent(attempt, max_attempts, err));
            }
            if attempt >= max_attempts {
                return Err(SmtpError::retries_exhausted(max_attempts, err));
            }

            let delay = self.delay_for(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, backing off"
            );
            on_retry(attempt, &err);

            tokio::select! {
                _ = cancel.cancelled() => return Err(SmtpError::cancelled()),
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::default())
    }

    fn transient() -> SmtpError {
        SmtpError::from_smtp_response(451, "local error, try again")
    }

    fn permanent() -> SmtpError {
        SmtpError::from_smtp_response(550, "mailbox unavailable")
    }

    #[rstest]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(3, 4)]
    #[case(4, 8)]
    #[case(5, 16)]
    #[case(6, 30)] // 32s capped
    #[case(10, 30)]
    fn backoff_doubles_and_caps(#[case] attempt: u32, #[case] expected_secs: u64) {
        assert_eq!(
            policy().delay_for(attempt),
            Duration::from_secs(expected_secs)
        );
    }

    #[test]
    fn backoff_is_monotonic() {
        let policy = policy();
        let mut last = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= last);
            assert!(delay <= DEFAULT_MAX_DELAY);
            last = delay;
        }
    }

    #[tokio::test]
    async fn first_attempt_success_needs_no_retry() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .run(
                &CancellationToken::new(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(42) }
                },
                |_, _| {},
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let err = policy()
            .run(
                &CancellationToken::new(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(permanent()) }
                },
                |_, _| {},
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), SmtpErrorKind::PermanentFailure);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_exhaust_the_budget() {
        let calls = AtomicU32::new(0);
        let retries = AtomicU32::new(0);
        let err = policy()
            .run(
                &CancellationToken::new(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(transient()) }
                },
                |_, _| {
                    retries.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), DEFAULT_MAX_ATTEMPTS);
        assert_eq!(retries.load(Ordering::SeqCst), DEFAULT_MAX_ATTEMPTS - 1);
        assert_eq!(err.kind(), SmtpErrorKind::RetriesExhausted);
        assert!(err.message().contains("max attempts reached (5)"));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .run(
                &CancellationToken::new(),
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err(transient())
                        } else {
                            Ok("delivered")
                        }
                    }
                },
                |_, _| {},
            )
            .await;

        assert_eq!(result.unwrap(), "delivered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_backoff_sleep() {
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(10)).await;
                cancel.cancel();
            })
        };

        // Backoff after the first failure is 1s; the cancel fires at
        // 10ms, long before the sleep would elapse.
        let calls = AtomicU32::new(0);
        let err = policy()
            .run(
                &cancel,
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(transient()) }
                },
                |_, _| {},
            )
            .await
            .unwrap_err();

        canceller.await.unwrap();
        assert_eq!(err.kind(), SmtpErrorKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_pool_surfaces_without_retry() {
        let calls = AtomicU32::new(0);
        let err = policy()
            .run(
                &CancellationToken::new(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<(), _>(SmtpError::pool(
                            SmtpErrorKind::PoolClosed,
                            "pool is closed",
                        ))
                    }
                },
                |_, _| {},
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), SmtpErrorKind::PoolClosed);
    }

    #[tokio::test]
    async fn pre_cancelled_token_skips_the_operation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let calls = AtomicU32::new(0);
        let err = policy()
            .run(
                &cancel,
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                |_, _| {},
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_error_wraps_the_last_failure() {
        let err = policy()
            .run(
                &CancellationToken::new(),
                |_| async { Err::<(), _>(transient()) },
                |_, _| {},
            )
            .await
            .unwrap_err();

        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("451"));
    }
}
