//! Bounded exponential backoff with jitter around a fallible async operation.
//!
//! Every network call made for the thread view goes through a [`RetryPolicy`].
//! A call either succeeds on some attempt or fails with the last error once
//! attempts (or the total sleep budget) run out; nothing partial is returned.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{AppError, AppResult, ErrorKind};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_TOTAL_DELAY: Duration = Duration::from_secs(4);
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero still attempts once.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Exclusive upper bound of the random jitter added to each delay.
    pub max_jitter: Duration,
    /// Ceiling for a single base delay.
    pub max_delay: Duration,
    /// Ceiling for the sum of all sleeps within one invocation.
    pub max_total_delay: Duration,
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_jitter: DEFAULT_MAX_JITTER,
            max_delay: DEFAULT_MAX_DELAY,
            max_total_delay: DEFAULT_MAX_TOTAL_DELAY,
            attempt_timeout: Some(DEFAULT_ATTEMPT_TIMEOUT),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl RetryPolicy {
    /// A single attempt, no sleeping.
    #[must_use]
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    #[must_use]
    pub const fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    #[must_use]
    pub const fn with_max_total_delay(mut self, max_total_delay: Duration) -> Self {
        self.max_total_delay = max_total_delay;
        self
    }

    #[must_use]
    pub const fn with_attempt_timeout(mut self, attempt_timeout: Option<Duration>) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.max_delay < self.initial_delay {
            return Err(AppError::validation(
                "retry max_delay must be >= initial_delay",
            ));
        }
        if self.attempt_timeout == Some(Duration::ZERO) {
            return Err(AppError::validation("retry attempt_timeout must be > 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// `initial_delay * 2^(attempt-1)` for a 1-indexed attempt, capped at `max_delay`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let base = duration_ms(self.initial_delay).saturating_mul(1u64 << exponent);
        Duration::from_millis(base.min(duration_ms(self.max_delay)))
    }

    /// Jitter outside `[0, max_jitter)` is clamped into it.
    #[must_use]
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        let max_jitter_ms = duration_ms(self.max_jitter);
        let jitter_ms = if max_jitter_ms == 0 {
            0
        } else {
            duration_ms(jitter).min(max_jitter_ms - 1)
        };
        self.base_delay(attempt)
            .saturating_add(Duration::from_millis(jitter_ms))
    }

    #[must_use]
    pub fn sample_jitter(&self) -> Duration {
        let max_jitter_ms = duration_ms(self.max_jitter);
        if max_jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_jitter_ms))
    }

    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, self.sample_jitter())
    }

    /// Retries every error.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_if(op, |_| true).await
    }

    /// Retries while `should_retry` accepts the error. The operation receives
    /// the 1-indexed attempt number.
    pub async fn run_if<T, E, F, Fut, P>(&self, mut op: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let attempts = self.effective_attempts();
        let mut slept = Duration::ZERO;
        let mut attempt = 1;

        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= attempts {
                warn!(attempt, error = %err, "retries exhausted");
                return Err(err);
            }
            if !should_retry(&err) {
                debug!(attempt, error = %err, "error is not retryable");
                return Err(err);
            }

            let delay = self.next_delay(attempt);
            if slept.saturating_add(delay) > self.max_total_delay {
                warn!(
                    attempt,
                    slept_ms = duration_ms(slept),
                    error = %err,
                    "retry budget exhausted"
                );
                return Err(err);
            }

            debug!(attempt, delay_ms = duration_ms(delay), error = %err, "retrying");
            tokio::time::sleep(delay).await;
            slept += delay;
            attempt += 1;
        }
    }

    /// Retries retryable [`AppError`]s and bounds each attempt by `attempt_timeout`.
    pub async fn run_app<T, F, Fut>(&self, mut op: F) -> AppResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let limit = self.attempt_timeout;
        self.run_if(
            move |attempt| {
                let fut = op(attempt);
                async move {
                    match limit {
                        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
                            Err(AppError::new(
                                ErrorKind::Timeout,
                                format!("attempt timed out after {}ms", duration_ms(limit)),
                            ))
                        }),
                        None => fut.await,
                    }
                }
            },
            AppError::is_retryable,
        )
        .await
    }
}
