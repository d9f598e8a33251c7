use crate::types::{
    MAX_RECONNECT_ATTEMPTS, RECONNECT_BACKOFF_FACTOR, RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY,
};
use std::time::Duration;

/// Exponential backoff curve with a delay ceiling and an attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// attempt ceiling is exceeded.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let multiplier = self.factor.max(1).saturating_pow(attempt - 1);
        let delay = self.base_delay.saturating_mul(multiplier);
        Some(delay.min(self.max_delay))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(RECONNECT_BASE_DELAY),
            factor: RECONNECT_BACKOFF_FACTOR,
            max_delay: Duration::from_millis(RECONNECT_MAX_DELAY),
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Stateful walk along a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    attempts: u32,
    policy: ReconnectPolicy,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            attempts: 0,
            policy,
        }
    }

    /// Get the next delay duration, `None` when the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        self.policy.delay_for(self.attempts)
    }

    /// Like `next_delay` but keeps returning the ceiling delay forever
    pub fn next_delay_capped(&mut self) -> Duration {
        self.next_delay().unwrap_or(self.policy.max_delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset the timer
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_curve_doubles_until_ceiling() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(5),
            factor: 3,
            max_delay: Duration::from_secs(30),
            max_attempts: 4,
        };
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(15)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay_for(5), None);
        assert_eq!(policy.delay_for(0), None);
    }

    #[test]
    fn test_capped_variant_and_reset() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            factor: 2,
            max_delay: Duration::from_millis(250),
            max_attempts: 2,
        });
        assert_eq!(backoff.next_delay_capped(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay_capped(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay_capped(), Duration::from_millis(250));
        backoff.reset();
        assert_eq!(backoff.next_delay_capped(), Duration::from_millis(100));
    }
}
