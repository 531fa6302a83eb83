//! Configuration types for the device-session crate
//!
//! This module defines the settings that control one session: where the
//! device lives, how long calls may take, how often liveness is checked and
//! how reconnects back off.

use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::SessionError;

/// How concurrent calls share the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Any number of calls in flight, correlated by id
    Multiplexed,
    /// Exactly one call in flight, the rest queue in FIFO order.
    /// For transports such as a BLE characteristic write/notify cycle.
    SingleSlot,
}

/// Configuration for a SessionManager
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Transport address of the device
    /// Default: "127.0.0.1:9090"
    pub address: String,

    /// Timeout for opening the transport and completing the handshake
    /// Default: 10 seconds
    pub connect_timeout: Duration,

    /// Default timeout for a single call
    /// Default: 5 seconds
    pub call_timeout: Duration,

    /// Interval between health checks and refresh polls while connected
    /// Default: 30 seconds
    pub poll_interval: Duration,

    /// Timeout for one health check
    /// Default: 5 seconds
    pub health_check_timeout: Duration,

    /// Consecutive failed health checks before the link is declared dead
    /// Default: 3
    pub max_unanswered_health_checks: u32,

    /// Maximum age of the last liveness proof while connected.
    /// `None` derives it from the poll interval and health-check budget.
    /// Default: None
    pub staleness_window: Option<Duration>,

    /// Reconnect backoff
    /// Default: 1s doubling up to 60s
    pub backoff: BackoffConfig,

    /// Call multiplexing mode
    /// Default: Multiplexed
    pub call_mode: CallMode,

    /// Keep reconnecting after network failures
    /// Default: true
    pub auto_reconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9090".to_string(),
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            max_unanswered_health_checks: 3,
            staleness_window: None,
            backoff: BackoffConfig::default(),
            call_mode: CallMode::Multiplexed,
            auto_reconnect: true,
        }
    }
}

impl SessionConfig {
    /// Create a SessionConfig for the given address with default values
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Create a SessionConfig for devices that handle one command at a time
    pub fn single_slot(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            call_mode: CallMode::SingleSlot,
            call_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Create a SessionConfig with frequent liveness checks
    pub fn fast_polling(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            poll_interval: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(2),
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(15),
                multiplier: 2.0,
            },
            ..Default::default()
        }
    }

    /// Create a SessionConfig that never reconnects on its own
    pub fn no_reconnect(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            auto_reconnect: false,
            ..Default::default()
        }
    }

    /// Staleness window actually in effect
    pub fn effective_staleness_window(&self) -> Duration {
        self.staleness_window.unwrap_or_else(|| {
            self.poll_interval
                .saturating_mul(self.max_unanswered_health_checks.saturating_add(1))
        })
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.address.trim().is_empty() {
            return Err(SessionError::Configuration(
                "Device address must not be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("Connect timeout", self.connect_timeout),
            ("Call timeout", self.call_timeout),
            ("Poll interval", self.poll_interval),
            ("Health check timeout", self.health_check_timeout),
        ] {
            if value == Duration::ZERO {
                return Err(SessionError::Configuration(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.max_unanswered_health_checks == 0 {
            return Err(SessionError::Configuration(
                "Max unanswered health checks must be greater than 0".to_string(),
            ));
        }

        if let Some(window) = self.staleness_window {
            if window < self.poll_interval {
                return Err(SessionError::Configuration(
                    "Staleness window must not be shorter than the poll interval".to_string(),
                ));
            }
        }

        if !(self.backoff.multiplier >= 1.0) {
            return Err(SessionError::Configuration(
                "Backoff multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.backoff.initial_delay == Duration::ZERO
            || self.backoff.initial_delay > self.backoff.max_delay
        {
            return Err(SessionError::Configuration(
                "Invalid backoff: initial delay must be positive and not exceed max".to_string(),
            ));
        }

        Ok(())
    }

    // Builder pattern methods for fluent configuration

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_health_checks(mut self, timeout: Duration, max_unanswered: u32) -> Self {
        self.health_check_timeout = timeout;
        self.max_unanswered_health_checks = max_unanswered;
        self
    }

    pub fn with_staleness_window(mut self, window: Duration) -> Self {
        self.staleness_window = Some(window);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff.initial_delay = initial;
        self.backoff.max_delay = max;
        self
    }

    pub fn with_call_mode(mut self, mode: CallMode) -> Self {
        self.call_mode = mode;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }
}
