//! Retry policy evaluation for steps.
//!
//! A [`RetryStrategy`] is a pure function from `(error, attempt)` to a
//! [`RetryDecision`]. The attempt number passed in is always derived from the
//! attempt count the backend recorded for the step, never from a local
//! counter, so decisions stay correct when an invocation only sees a slice of
//! the execution's history.

use std::sync::Arc;

use crate::error::DurableError;

/// Outcome of evaluating a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether another attempt should be scheduled
    pub should_retry: bool,
    /// Delay before the next attempt, in seconds
    pub delay_seconds: Option<u64>,
}

impl RetryDecision {
    /// Schedule another attempt after `delay_seconds`.
    pub fn retry_after(delay_seconds: u64) -> Self {
        Self {
            should_retry: true,
            delay_seconds: Some(delay_seconds),
        }
    }

    /// Give up; the step fails permanently.
    pub fn give_up() -> Self {
        Self {
            should_retry: false,
            delay_seconds: None,
        }
    }
}

/// Decides whether a failed step attempt is retried.
pub trait RetryStrategy: Send + Sync {
    /// Evaluates the policy for the given failure.
    ///
    /// `attempt` is 1-based: the first failed attempt is attempt 1.
    fn decide(&self, error: &DurableError, attempt: u32) -> RetryDecision;
}

/// Exponential backoff without jitter, capped at `max_delay_seconds`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    /// Total attempts allowed, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay_seconds: u64,
    /// Upper bound for any delay
    pub max_delay_seconds: u64,
    /// Multiplier applied per attempt
    pub backoff_rate: f64,
}

impl ExponentialBackoff {
    /// Returns the delay scheduled after the given failed attempt.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.initial_delay_seconds as f64 * self.backoff_rate.powi(exponent);
        let capped = raw.min(self.max_delay_seconds as f64).max(1.0);
        capped.ceil() as u64
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay_seconds: 5,
            max_delay_seconds: 60,
            backoff_rate: 2.0,
        }
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn decide(&self, _error: &DurableError, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::give_up();
        }
        RetryDecision::retry_after(self.delay_for(attempt))
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn decide(&self, _error: &DurableError, _attempt: u32) -> RetryDecision {
        RetryDecision::give_up()
    }
}

/// Adapts a closure into a [`RetryStrategy`].
pub struct FnRetryStrategy<F>(pub F);

impl<F> RetryStrategy for FnRetryStrategy<F>
where
    F: Fn(&DurableError, u32) -> RetryDecision + Send + Sync,
{
    fn decide(&self, error: &DurableError, attempt: u32) -> RetryDecision {
        (self.0)(error, attempt)
    }
}

/// Ready-made policies.
pub struct RetryPresets;

impl RetryPresets {
    /// The policy steps use when none is configured: 6 attempts, 5s doubling up to 60s.
    pub fn default_policy() -> Arc<dyn RetryStrategy> {
        Arc::new(ExponentialBackoff::default())
    }

    /// Fail on the first error.
    pub fn none() -> Arc<dyn RetryStrategy> {
        Arc::new(NoRetry)
    }

    /// A fixed delay between at most `max_attempts` attempts.
    pub fn fixed(max_attempts: u32, delay_seconds: u64) -> Arc<dyn RetryStrategy> {
        Arc::new(ExponentialBackoff {
            max_attempts,
            initial_delay_seconds: delay_seconds,
            max_delay_seconds: delay_seconds,
            backoff_rate: 1.0,
        })
    }
}
