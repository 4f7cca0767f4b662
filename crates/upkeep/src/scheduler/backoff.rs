use std::time::Duration;

use crate::settings::AppSettings;

const MAX_CEILING: u32 = 100;

/// Exponential retry delays bounded by `[min, max]`, plus the attempt ceiling
/// derived from a total time budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial: Duration,
    min: Duration,
    max: Duration,
    total_budget: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, min: Duration, max: Duration, total_budget: Duration) -> Self {
        Self {
            initial,
            min,
            max: max.max(min),
            total_budget,
        }
    }

    pub fn from_settings(settings: &AppSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.retry_initial_secs),
            Duration::from_secs(settings.retry_min_secs),
            Duration::from_secs(settings.retry_max_secs),
            Duration::from_secs(settings.retry_budget_secs),
        )
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retrying after `attempt` failed attempts (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial
            .saturating_mul(factor)
            .clamp(self.min, self.max)
    }

    /// Number of retry delays, starting from the first, whose sum first
    /// reaches the total budget.
    pub fn max_attempts(&self) -> u32 {
        let mut elapsed = Duration::ZERO;
        for attempt in 0..MAX_CEILING {
            elapsed = elapsed.saturating_add(self.delay(attempt));
            if elapsed >= self.total_budget {
                return attempt + 1;
            }
        }
        MAX_CEILING
    }
}
