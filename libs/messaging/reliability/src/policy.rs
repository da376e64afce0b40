use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Delay schedule applied after an unexpected close or a failed connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconnectPolicy {
    /// Same delay before every attempt
    Fixed {
        delay: Duration,
        max_attempts: Option<u32>,
    },
    /// `initial * multiplier^(n-1)`, capped at `max_delay`
    ExponentialBackoff {
        initial: Duration,
        multiplier: f64,
        max_delay: Duration,
        max_attempts: Option<u32>,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed {
            delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        ReconnectPolicy::Fixed {
            delay,
            max_attempts: None,
        }
    }

    pub fn exponential(initial: Duration, multiplier: f64, max_delay: Duration) -> Self {
        ReconnectPolicy::ExponentialBackoff {
            initial,
            multiplier,
            max_delay,
            max_attempts: None,
        }
    }

    /// Bound the number of consecutive failures tolerated
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        match &mut self {
            ReconnectPolicy::Fixed { max_attempts, .. }
            | ReconnectPolicy::ExponentialBackoff { max_attempts, .. } => {
                *max_attempts = Some(attempts)
            }
        }
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            ReconnectPolicy::Fixed { max_attempts, .. }
            | ReconnectPolicy::ExponentialBackoff { max_attempts, .. } => *max_attempts,
        }
    }

    /// Delay before reconnecting after `failures` consecutive failures
    /// (1-based). `None` once the attempt ceiling is reached.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts() {
            if failures > max {
                return None;
            }
        }

        match self {
            ReconnectPolicy::Fixed { delay, .. } => Some(*delay),
            ReconnectPolicy::ExponentialBackoff {
                initial,
                multiplier,
                max_delay,
                ..
            } => {
                let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                let capped = if secs.is_finite() {
                    secs.min(max_delay.as_secs_f64()).max(0.0)
                } else {
                    max_delay.as_secs_f64()
                };
                Some(Duration::from_secs_f64(capped))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fixed_five_seconds_unbounded() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for(1_000), Some(Duration::from_secs(5)));
        assert_eq!(policy.max_attempts(), None);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = ReconnectPolicy::exponential(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
        );
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_millis(800)));
        assert_eq!(policy.delay_for(5), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(500), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_attempt_ceiling() {
        let policy = ReconnectPolicy::fixed(Duration::from_secs(1)).with_max_attempts(2);
        assert!(policy.delay_for(2).is_some());
        assert!(policy.delay_for(3).is_none());
    }
}
