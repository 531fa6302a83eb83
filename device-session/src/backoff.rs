//! Backoff and retry policies
//!
//! Reconnects use exponential backoff with a cap. Commands can opt into a
//! retry policy: some devices (relays, set-top boxes) are known to drop the
//! first command after waking, so a fixed number of quick retries is offered
//! next to the exponential variant.

use std::time::Duration;

/// Parameters of an exponential backoff sequence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    /// Default: 1 second
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    /// Default: 60 seconds
    pub max_delay: Duration,

    /// Growth factor applied after each attempt
    /// Default: 2.0
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Stateful exponential backoff: initial, initial × m, initial × m², ... capped
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay for the given zero-based attempt, without advancing
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_delay.as_secs_f64();
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = initial * self.config.multiplier.powi(exponent);
        let max = self.config.max_delay.as_secs_f64();
        if !raw.is_finite() || raw >= max {
            self.config.max_delay
        } else {
            Duration::from_secs_f64(raw)
        }
    }

    /// Return the next delay and advance the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Start over from the initial delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// How a command is re-issued after a retryable failure
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// Issue once
    None,
    /// Up to `attempts` tries in total, `delay` apart
    Fixed { attempts: u32, delay: Duration },
    /// Up to `attempts` tries in total, with growing delays
    Exponential { attempts: u32, backoff: BackoffConfig },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::None
    }
}

impl RetryPolicy {
    /// Total number of tries, including the first one
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::None => 1,
            RetryPolicy::Fixed { attempts, .. } | RetryPolicy::Exponential { attempts, .. } => {
                (*attempts).max(1)
            }
        }
    }

    /// Delay to wait after the failed zero-based try `attempt`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::None => Duration::ZERO,
            RetryPolicy::Fixed { delay, .. } => *delay,
            RetryPolicy::Exponential { backoff, .. } => {
                ExponentialBackoff::new(*backoff).delay_for(attempt)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_sequence() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::default());
        let delays: Vec<u64> = (0..9).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
        assert_eq!(backoff.attempt(), 9);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_huge_attempt_is_capped() {
        let backoff = ExponentialBackoff::new(BackoffConfig::default());
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_policy_attempts() {
        assert_eq!(RetryPolicy::None.max_attempts(), 1);
        let fixed = RetryPolicy::Fixed {
            attempts: 3,
            delay: Duration::from_millis(500),
        };
        assert_eq!(fixed.max_attempts(), 3);
        assert_eq!(fixed.delay_after(0), Duration::from_millis(500));
        assert_eq!(fixed.delay_after(2), Duration::from_millis(500));

        let zero = RetryPolicy::Fixed {
            attempts: 0,
            delay: Duration::ZERO,
        };
        assert_eq!(zero.max_attempts(), 1);

        let exp = RetryPolicy::Exponential {
            attempts: 4,
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                multiplier: 3.0,
            },
        };
        assert_eq!(exp.delay_after(0), Duration::from_millis(100));
        assert_eq!(exp.delay_after(1), Duration::from_millis(300));
        assert_eq!(exp.delay_after(2), Duration::from_millis(900));
        assert_eq!(exp.delay_after(3), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn prop_delays_monotonic_and_capped(
            initial_ms in 1u64..5_000,
            max_ms in 5_000u64..120_000,
            multiplier in 1.0f64..4.0,
        ) {
            let mut backoff = ExponentialBackoff::new(BackoffConfig {
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms),
                multiplier,
            });
            let mut previous = Duration::ZERO;
            for _ in 0..40 {
                let delay = backoff.next_delay();
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(max_ms));
                previous = delay;
            }
        }
    }
}
