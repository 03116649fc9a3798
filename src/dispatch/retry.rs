//! Bounded retry with exponential backoff.
//!
//! The decision is a pure function of the attempt count and the error, so the
//! pending → in_flight → pending → … → terminal walk can be tested without a
//! transport.

use std::time::Duration;

use rand::Rng;

use crate::error::DeliveryError;

/// What to do with an item after a failed send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the item back to pending, claimable again after `delay`.
    Retry { delay: Duration },
    /// Finalize the item as failed.
    GiveUp,
}

/// Retry budget and backoff shape for transient delivery failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per further attempt.
    pub factor: f64,
    /// Randomize each delay into `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries `max_attempts - 1` times with no delay.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
            jitter: false,
        }
    }

    /// Decide the fate of an item that has failed `attempts` times so far.
    pub fn decide(&self, attempts: u32, error: &DeliveryError) -> RetryDecision {
        if !error.is_transient() || attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        let mut delay = self.backoff(attempts);
        // A server hint can lengthen the wait but never past max_delay
        if let DeliveryError::RateLimited {
            retry_after: Some(after),
        } = error
        {
            delay = delay.max((*after).min(self.max_delay));
        }
        RetryDecision::Retry { delay }
    }

    /// Delay after the `attempt`-th failure (1-based), before jitter is applied.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.factor.max(1.0).powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.base_backoff(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let scale = rand::thread_rng().gen_range(0.5..=1.0);
        delay.mul_f64(scale)
    }
}
