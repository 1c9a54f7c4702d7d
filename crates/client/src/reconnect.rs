//! Exponential backoff for automatic reconnection.

use std::time::Duration;

/// Default delay before the first reconnect attempt.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default cap on the delay between attempts.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default number of consecutive attempts before giving up.
const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// How long to wait between reconnect attempts, and how many to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Consecutive failed attempts allowed before the client gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Creates a policy with explicit bounds.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Delay before the 1-based `attempt`: `base * 2^(attempt - 1)`, capped
    /// at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
