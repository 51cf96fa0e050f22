//! # Retry Logic and Backoff
//!
//! Decides when a queued mutation that failed may be replayed again, and when
//! it has used up its attempts and must wait for a human decision.
//!
//! ## Policy
//!
//! - **Exponential backoff**: `base * 2^(attempts - 1)`, capped at `max_delay`
//! - **Max attempts**: an item that reaches the limit is marked failed and is
//!   never replayed automatically again

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// No delay between retries
    Immediate,
    /// Fixed interval between retries
    Fixed {
        /// Interval in seconds
        interval_seconds: u64,
    },
    /// Exponential backoff
    Exponential {
        /// Base interval in seconds
        base_interval: u64,
        /// Maximum interval in seconds
        max_interval: u64,
    },
}

/// What to do with an item after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Replay again after the delay
    RetryAfter(Duration),
    /// Attempt budget spent
    GiveUp,
}

/// Retry policy for queued mutations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before an item is marked failed
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffStrategy::Exponential {
                base_interval: 2,
                max_interval: 300, // 5 minutes
            },
        }
    }
}

impl RetryPolicy {
    /// Policy that retries on every flush, used by tests and manual retries
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Immediate,
        }
    }

    /// Decide after `attempts` failed attempts
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        if attempts >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.delay(attempts))
        }
    }

    /// Delay before the next attempt after `attempts` failures
    pub fn delay(&self, attempts: u32) -> Duration {
        let seconds = match &self.backoff {
            BackoffStrategy::Immediate => 0,
            BackoffStrategy::Fixed { interval_seconds } => *interval_seconds,
            BackoffStrategy::Exponential {
                base_interval,
                max_interval,
            } => {
                let exponent = attempts.saturating_sub(1).min(32);
                base_interval
                    .saturating_mul(2u64.saturating_pow(exponent))
                    .min(*max_interval)
            }
        };
        Duration::from_secs(seconds)
    }
}
