//! Escalating status-poll schedule.

use std::time::Duration;

/// Delay before each status request, by attempt number.
///
/// Defaults: 5 s for the first 24 attempts, 10 s until attempt 60, then
/// 15 s, for at most 240 attempts. A 429 adds `rate_limit_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub fast: Duration,
    pub fast_attempts: u32,
    pub medium: Duration,
    pub medium_until: u32,
    pub slow: Duration,
    pub max_attempts: u32,
    pub rate_limit_backoff: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(5),
            fast_attempts: 24,
            medium: Duration::from_secs(10),
            medium_until: 60,
            slow: Duration::from_secs(15),
            max_attempts: 240,
            rate_limit_backoff: Duration::from_secs(30),
        }
    }
}

impl PollSchedule {
    /// Same delay for every attempt.
    pub fn uniform(delay: Duration, max_attempts: u32) -> Self {
        Self {
            fast: delay,
            fast_attempts: max_attempts,
            medium: delay,
            medium_until: max_attempts,
            slow: delay,
            max_attempts,
            rate_limit_backoff: delay,
        }
    }

    /// `attempt` counts completed polls, starting at zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt < self.fast_attempts {
            self.fast
        } else if attempt < self.medium_until {
            self.medium
        } else {
            self.slow
        }
    }

    /// Sum of every scheduled delay, ignoring rate-limit back-off.
    pub fn total_budget(&self) -> Duration {
        (0..self.max_attempts).map(|a| self.delay_for(a)).sum()
    }
}
