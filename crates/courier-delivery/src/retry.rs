//! Retry classification and exponential backoff with additive jitter.
//!
//! A failed attempt is classified in a fixed order:
//!
//! 1. no HTTP response (network error, timeout) is retryable
//! 2. a status in the policy's no-retry set is not retryable
//! 3. a status in the policy's retry set is retryable
//! 4. otherwise a status is retryable iff it is 5xx, 408 or 429
//!
//! Retry delays follow `min(initial * multiplier^(attempt-1), max_delay)`
//! plus a uniformly random jitter in `[0, jitter]`. Jitter only ever adds,
//! so the delay is never below the exponential value. Circuit-open
//! rejections bypass the formula and wait for the breaker's recovery delay.

use std::time::Duration;

use courier_core::RetryPolicy;
use rand::Rng;

use crate::error::{DeliveryError, ErrorCategory};

/// Largest accepted `max_delay` or `jitter` for a retry policy.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Outcome of applying the retry policy to a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after at least `delay`.
    Retry {
        /// Minimum wait before the next attempt
        delay: Duration,
        /// Whether the delay came from the circuit breaker
        circuit_open: bool,
    },
    /// Finalize and hand off to the dead-letter handler.
    GiveUp {
        /// Why the job will not be retried
        reason: String,
    },
}

/// Everything needed to decide what happens after a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    /// Attempt that just failed (1-based).
    pub attempt_number: u32,
    /// Failure observed.
    pub error: &'a DeliveryError,
    /// Policy snapshot of the job.
    pub policy: &'a RetryPolicy,
}

impl<'a> RetryContext<'a> {
    /// Creates a retry context.
    pub fn new(attempt_number: u32, error: &'a DeliveryError, policy: &'a RetryPolicy) -> Self {
        Self { attempt_number, error, policy }
    }

    /// Decides whether and when to retry.
    pub fn decide(&self) -> RetryDecision {
        if !is_retryable(self.error, self.policy) {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        if self.attempt_number >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exhausted", self.policy.max_attempts),
            };
        }

        match self.error {
            DeliveryError::CircuitOpen { retry_after, .. } => {
                RetryDecision::Retry { delay: *retry_after, circuit_open: true }
            },
            _ => RetryDecision::Retry {
                delay: backoff_delay(self.policy, self.attempt_number),
                circuit_open: false,
            },
        }
    }
}

/// Policy-aware retry classification.
pub fn is_retryable(error: &DeliveryError, policy: &RetryPolicy) -> bool {
    matches!(
        classify(error, policy),
        ErrorCategory::TransientNetwork | ErrorCategory::TransientServer | ErrorCategory::CircuitOpen
    )
}

/// Policy-aware error category.
///
/// Explicit status sets override the default status classification; the
/// no-retry set wins when a status appears in both.
pub fn classify(error: &DeliveryError, policy: &RetryPolicy) -> ErrorCategory {
    let Some(status_code) = error.status_code() else {
        return ErrorCategory::from(error);
    };

    if policy.no_retry_on_status.contains(&status_code) {
        ErrorCategory::PermanentClient
    } else if policy.retry_on_status.contains(&status_code) {
        ErrorCategory::TransientServer
    } else {
        ErrorCategory::for_status(status_code)
    }
}

/// Capped exponential delay for `attempt` (1-based), without jitter.
pub fn exponential_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let factor = policy.backoff_multiplier.max(1.0).powi(exponent);
    let seconds = policy.initial_delay.as_secs_f64() * factor;

    match Duration::try_from_secs_f64(seconds) {
        Ok(delay) => delay.min(policy.max_delay),
        Err(_) => policy.max_delay,
    }
}

/// Exponential delay plus random jitter in `[0, policy.jitter]`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    exponential_delay(policy, attempt).saturating_add(random_jitter(policy.jitter))
}

fn random_jitter(bound: Duration) -> Duration {
    let bound_micros = u64::try_from(bound.as_micros()).unwrap_or(u64::MAX);
    if bound_micros == 0 {
        return Duration::ZERO;
    }

    Duration::from_micros(rand::rng().random_range(0..=bound_micros))
}

/// Balanced default: 5 attempts, 1s initial delay doubling up to 5 minutes.
pub fn default_policy() -> RetryPolicy {
    RetryPolicy::default()
}

/// For fast APIs with short timeouts.
pub fn fast_api_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        initial_delay: Duration::from_millis(200),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
        jitter: Duration::from_millis(100),
        timeout: Duration::from_secs(5),
        ..RetryPolicy::default()
    }
}

/// For batch consumers that tolerate long delays.
pub fn batch_processing_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 15,
        initial_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(3600),
        backoff_multiplier: 2.0,
        jitter: Duration::from_secs(5),
        timeout: Duration::from_secs(60),
        ..RetryPolicy::default()
    }
}
