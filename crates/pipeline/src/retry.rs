//! Exponential backoff between attempts of a single job.

use std::time::Duration;

/// Tunable parameters for the backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Total attempts including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    /// Four attempts with 1 s, 2 s and 4 s between them.
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            multiplier: 2.0,
            max_attempts: 4,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delays between consecutive attempts; one fewer than `max_attempts`.
    pub fn delays(&self) -> Vec<Duration> {
        let mut out = Vec::new();
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..self.max_attempts {
            out.push(delay);
            delay = next_delay(delay, self);
        }
        out
    }
}

/// Calculate the next backoff delay, clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}
