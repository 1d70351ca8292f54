//! Fixed-table retry policy.
//!
//! A failed attempt `n` is followed by attempt `n + 1` after
//! `backoff[n - 1]`, or after `rate_limited_delay` when the limiter denied
//! it. Once `max_attempts` attempts have failed the pair is given up.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Maximum attempts per (webhook, event) pair, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Backoff after each failed attempt, in minutes.
pub const DEFAULT_BACKOFF_MINUTES: [u64; 5] = [1, 5, 10, 30, 60];

/// Delay before retrying a rate-limited attempt.
pub const DEFAULT_RATE_LIMITED_DELAY: Duration = Duration::from_secs(60);

/// Retry policy for webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts (including initial attempt).
    pub max_attempts: u32,

    /// Delay after the attempt that just failed, indexed from attempt 1.
    /// Attempts beyond the table reuse its last entry.
    pub backoff: Vec<Duration>,

    /// Delay after a rate-limit denial, regardless of the table.
    pub rate_limited_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF_MINUTES.iter().map(|m| Duration::from_secs(m * 60)).collect(),
            rate_limited_delay: DEFAULT_RATE_LIMITED_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Builds a policy from a backoff table in minutes.
    pub fn from_minutes(max_attempts: u32, backoff_minutes: &[u64], rate_limited_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: backoff_minutes.iter().map(|m| Duration::from_secs(m * 60)).collect(),
            rate_limited_delay,
        }
    }

    /// Backoff after `attempt_number` failed.
    pub fn backoff_after(&self, attempt_number: u32) -> Duration {
        let index = usize::try_from(attempt_number.saturating_sub(1)).unwrap_or(usize::MAX);
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Retry decision context for a failed delivery attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt that just failed (1-based).
    pub attempt_number: u32,
    /// Error that caused the delivery failure.
    pub error: DeliveryError,
    /// Timestamp of the failed attempt.
    pub failed_at: DateTime<Utc>,
    /// Retry policy to apply.
    pub policy: RetryPolicy,
}

/// Result of retry decision calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule the next attempt.
    Retry {
        /// When the next delivery attempt should be made
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop: budget spent or error not retryable.
    GiveUp {
        /// Reason why the delivery should not be retried
        reason: String,
        /// Whether the retry budget was the reason
        exhausted: bool,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed delivery.
    pub fn new(
        attempt_number: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt_number, error, failed_at, policy }
    }

    /// Determines if and when to retry.
    ///
    /// Rate-limit denials count toward the attempt budget like any other
    /// failure; they only change the delay.
    pub fn decide_retry(&self) -> RetryDecision {
        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
                exhausted: false,
            };
        }

        if self.attempt_number >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.policy.max_attempts),
                exhausted: true,
            };
        }

        let Ok(delay) = chrono::Duration::from_std(self.calculate_delay()) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
                exhausted: false,
            };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + delay }
    }

    fn calculate_delay(&self) -> Duration {
        if matches!(self.error, DeliveryError::RateLimited) {
            return self.policy.rate_limited_delay;
        }
        self.policy.backoff_after(self.attempt_number)
    }
}
