//! # Retry Controller
//!
//! Bounded in-place retry for command handlers. A handler gets at most
//! `max_retries + 1` attempts; between attempts the controller waits either
//! `base_delay × attempt` or the delay from an explicit per-attempt schedule.
//!
//! Every error returned by the operation is retried. Payload validation errors
//! and transient failures are treated the same way here.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::config::RetryConfig;

/// Error returned once every attempt has failed
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
}

impl<E> RetryError<E> {
    /// Stable error name used in dead-letter payloads
    pub const NAME: &'static str = "RetriesExhaustedError";

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn last_error(&self) -> &E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
        }
    }
}

/// Information handed to the `on_retry` callback before each wait
#[derive(Debug)]
pub struct RetryEvent<'a, E> {
    /// The attempt that just failed (1-based)
    pub attempt: u32,
    pub delay_ms: u64,
    pub error: &'a E,
}

/// Retry bounds and backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Explicit delay per retry; the last entry repeats when attempts outrun it
    pub delay_schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            delay_schedule: config
                .delay_schedule_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            delay_schedule: Vec::new(),
        }
    }

    pub fn with_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.delay_schedule = schedule;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after the failed `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if let Some(last) = self.delay_schedule.last() {
            let idx = attempt.saturating_sub(1) as usize;
            return self.delay_schedule.get(idx).copied().unwrap_or(*last);
        }
        self.base_delay.saturating_mul(attempt)
    }
}

/// Runs an operation under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds or attempts are exhausted.
    ///
    /// `operation` receives the 1-based attempt number. On success the value is
    /// returned together with the number of attempts used.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        mut operation: F,
        mut on_retry: R,
    ) -> Result<(T, u32), RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(RetryEvent<'_, E>),
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(error) if attempt >= max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last_error: error,
                    });
                }
                Err(error) => {
                    let delay = self.policy.delay_for(attempt);
                    on_retry(RetryEvent {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: &error,
                    });
                    debug!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after failed attempt"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
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
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(600));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_explicit_schedule_repeats_last_entry() {
        let policy = RetryPolicy::new(4, Duration::from_millis(999)).with_schedule(vec![
            Duration::from_millis(10),
            Duration::from_millis(50),
        ]);
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(50));
        assert_eq!(policy.delay_for(4), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_always_failing_operation_is_bounded() {
        let controller = RetryController::new(RetryPolicy::new(2, Duration::ZERO));
        let calls = AtomicU32::new(0);
        let mut retry_events = Vec::new();

        let result: Result<((), u32), RetryError<String>> = controller
            .run(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(format!("boom on attempt {attempt}")) }
                },
                |event| retry_events.push((event.attempt, event.delay_ms, event.error.clone())),
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.last_error(), "boom on attempt 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retry_events.len(), 2);
        assert_eq!(retry_events[0].0, 1);
        assert!(err.to_string().contains("Retries exhausted after 3 attempts"));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failure() {
        let controller = RetryController::new(RetryPolicy::new(3, Duration::from_millis(1)));

        let (value, attempts) = controller
            .run(
                |attempt| async move {
                    if attempt < 2 {
                        Err("transient")
                    } else {
                        Ok(attempt * 10)
                    }
                },
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(value, 20);
        assert_eq!(attempts, 2);
    }
}
