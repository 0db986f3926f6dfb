// SPDX-License-Identifier: GPL-3.0-only

//! Reusable retry/backoff policy
//!
//! Open, reconnect and resume paths all share this one policy instead of
//! re-implementing sleep loops at each call site. An attempt count of `n`
//! means `n` tries in total; a delay is taken after every failed attempt
//! except the last.

use crate::constants::retry;
use std::time::Duration;

/// Bounded retry schedule with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts (>= 1)
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Growth factor applied per subsequent failure
    pub multiplier: f64,
    /// Upper bound on any single delay
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: retry::OPEN_MAX_ATTEMPTS,
            base_delay: retry::OPEN_BASE_DELAY,
            multiplier: retry::BACKOFF_MULTIPLIER,
            ceiling: retry::BACKOFF_CEILING,
        }
    }
}

impl RetryPolicy {
    /// Fixed-delay policy (multiplier 1.0)
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            multiplier: 1.0,
            ceiling: delay,
        }
    }

    /// Policy with the default exponential shape but a custom attempt count
    /// and base delay
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Delay to sleep after the failed attempt with the given zero-based
    /// index. Capped at the ceiling.
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let factor = self.multiplier.powi(failed_attempt as i32);
        let raw = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(raw.min(self.ceiling.as_secs_f64()))
    }

    /// All delays the schedule can produce, in order. One fewer than
    /// `max_attempts` since no delay follows the final failure.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|i| self.delay_for(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            ceiling: Duration::from_secs(10),
        };
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
    }

    #[test]
    fn fixed_policy_has_constant_delays() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(100));
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(delays, vec![Duration::from_millis(100); 2]);
    }

    #[test]
    fn single_attempt_has_no_delays() {
        let policy = RetryPolicy::fixed(1, Duration::from_secs(1));
        assert_eq!(policy.delays().count(), 0);
    }
}
