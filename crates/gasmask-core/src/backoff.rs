//! Reconnect backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Bounded exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts made before giving up.
    pub max_attempts: u32,
    /// Delay before the first attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            multiplier: 1.5,
            max_delay_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before attempt number `attempt` (1-based).
    ///
    /// Returns `None` once the attempt budget is spent.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Every delay of the schedule, in order.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).filter_map(|attempt| self.delay_for(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let delays: Vec<u64> = ReconnectPolicy::default()
            .schedule()
            .map(|d| u64::try_from(d.as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![1_000, 1_500, 2_250, 3_375, 5_062]);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = ReconnectPolicy {
            max_attempts: 20,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay_for(20), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_budget_is_bounded() {
        let policy = ReconnectPolicy::default();
        assert!(policy.delay_for(5).is_some());
        assert_eq!(policy.delay_for(6), None);
        assert_eq!(policy.delay_for(0), None);
        assert_eq!(policy.schedule().count(), 5);
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let policy = ReconnectPolicy {
            max_attempts: 0,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay_for(1), None);
    }
}
