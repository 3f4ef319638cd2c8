//! Rate-limit aware retry for outbound channel calls.
//!
//! The channel's declared wait is authoritative: there is no exponential
//! backoff and, by default, no attempt cap. Any error other than
//! `RateLimited` is returned to the caller on the first occurrence. Wrapped
//! operations must be safe to repeat (a send, not an increment).

use std::{future::Future, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tankobon_core::Clock;
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Retry policy for outbound channel calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Longest single wait, whatever the channel declares.
    pub max_wait: Duration,

    /// Budget for cumulative waiting within one call. `None` keeps waiting
    /// for as long as the channel keeps asking.
    pub max_total_wait: Option<Duration>,

    /// Extra random wait (0.0 to 1.0 of the declared wait) added on top.
    /// Never shortens the declared wait.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(crate::DEFAULT_MAX_RETRY_WAIT_SECONDS),
            max_total_wait: None,
            jitter_factor: 0.0,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `wait` and call again.
    Retry {
        /// How long to sleep before the next attempt
        wait: Duration,
    },
    /// Return the error to the caller.
    GiveUp,
    /// The wait budget is spent.
    Exhausted,
}

impl RetryPolicy {
    /// Policy that caps total waiting per call.
    pub fn with_total_budget(max_total_wait: Duration) -> Self {
        Self { max_total_wait: Some(max_total_wait), ..Self::default() }
    }

    /// Decides how to proceed after `error`, given the time already spent
    /// waiting on this call.
    pub fn decide(&self, error: &DeliveryError, waited: Duration) -> RetryDecision {
        let Some(retry_after) = error.retry_after() else {
            return RetryDecision::GiveUp;
        };

        let wait = apply_jitter(retry_after.min(self.max_wait), self.jitter_factor);

        match self.max_total_wait {
            Some(budget) if waited.saturating_add(wait) > budget => RetryDecision::Exhausted,
            _ => RetryDecision::Retry { wait },
        }
    }

    /// Runs `operation` until it succeeds or fails with a non-retryable
    /// error. The closure receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the first non-rate-limit error, or `RetriesExhausted` when
    /// `max_total_wait` is set and spent.
    pub async fn execute<T, F, Fut>(&self, clock: &dyn Clock, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0_u32;
        let mut waited = Duration::ZERO;

        loop {
            attempt = attempt.saturating_add(1);

            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            attempts = attempt,
                            waited_ms = waited.as_millis(),
                            "outbound call succeeded after rate limiting"
                        );
                    }
                    return Ok(value);
                },
                Err(error) => error,
            };

            match self.decide(&error, waited) {
                RetryDecision::Retry { wait } => {
                    warn!(
                        attempt,
                        retry_after_ms = error.retry_after().unwrap_or_default().as_millis(),
                        wait_ms = wait.as_millis(),
                        "outbound channel rate limited, waiting"
                    );
                    clock.sleep(wait).await;
                    waited = waited.saturating_add(wait);
                },
                RetryDecision::GiveUp => return Err(error),
                RetryDecision::Exhausted => {
                    warn!(
                        attempts = attempt,
                        waited_ms = waited.as_millis(),
                        "rate limit wait budget exhausted"
                    );
                    return Err(DeliveryError::RetriesExhausted { attempts: attempt, waited });
                },
            }
        }
    }
}

/// Adds up to `jitter_factor * duration` of random extra wait.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let extra = rand::rng().random_range(0.0..=duration.as_secs_f64() * clamped);

    duration.saturating_add(Duration::try_from_secs_f64(extra).unwrap_or(Duration::MAX))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use tankobon_core::{RecipientId, TestClock};

    use super::*;

    #[tokio::test]
    async fn waits_declared_time_and_retries() {
        let clock = TestClock::new();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let result = policy
            .execute(&clock, |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(DeliveryError::rate_limited(Duration::from_secs(1)))
                    } else {
                        Ok("sent")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(clock.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let clock = TestClock::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = RetryPolicy::default()
            .execute(&clock, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DeliveryError::blocked(RecipientId(5))) }
            })
            .await;

        assert!(matches!(result, Err(DeliveryError::RecipientBlocked { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.recorded_sleeps().is_empty());
    }

    #[tokio::test]
    async fn single_wait_is_capped() {
        let clock = TestClock::new();
        let policy = RetryPolicy { max_wait: Duration::from_secs(10), ..RetryPolicy::default() };

        let _ = policy
            .execute(&clock, |attempt| async move {
                if attempt == 1 {
                    Err(DeliveryError::rate_limited(Duration::from_secs(3600)))
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(clock.recorded_sleeps(), vec![Duration::from_secs(10)]);
    }

    #[tokio::test]
    async fn total_budget_stops_retrying() {
        let clock = TestClock::new();
        let policy = RetryPolicy::with_total_budget(Duration::from_secs(5));

        let result: Result<()> = policy
            .execute(&clock, |_| async {
                Err(DeliveryError::rate_limited(Duration::from_secs(2)))
            })
            .await;

        match result {
            Err(DeliveryError::RetriesExhausted { attempts, waited }) => {
                assert_eq!(attempts, 3);
                assert_eq!(waited, Duration::from_secs(4));
            },
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn jitter_only_extends_wait() {
        let base = Duration::from_secs(4);
        for _ in 0..100 {
            let jittered = apply_jitter(base, 0.5);
            assert!(jittered >= base);
            assert!(jittered <= Duration::from_secs(6));
        }
    }

    #[test]
    fn jitter_saturates_on_huge_waits() {
        assert_eq!(apply_jitter(Duration::MAX, 1.0), Duration::MAX);

        let policy = RetryPolicy { max_wait: Duration::MAX, jitter_factor: 0.5, ..RetryPolicy::default() };
        assert_eq!(
            policy.decide(&DeliveryError::rate_limited(Duration::MAX), Duration::ZERO),
            RetryDecision::Retry { wait: Duration::MAX }
        );
    }

    #[test]
    fn decide_gives_up_on_non_rate_limit() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&DeliveryError::network("reset"), Duration::ZERO),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.decide(&DeliveryError::rate_limited(Duration::from_secs(7)), Duration::ZERO),
            RetryDecision::Retry { wait: Duration::from_secs(7) }
        );
    }
}
