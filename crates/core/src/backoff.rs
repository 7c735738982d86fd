//! Exponential backoff shared by the tunnel reconnect loop and the
//! robot agent's queue-outage retries.
//!
//! The delay starts at [`BackoffConfig::initial_delay`], grows by
//! [`BackoffConfig::multiplier`] after each failure, is clamped to
//! [`BackoffConfig::max_delay`], and snaps back to the initial value on
//! [`Backoff::reset`].

use std::time::Duration;

use crate::error::CoreError;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
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

impl BackoffConfig {
    /// Reject configurations that would shrink or stall the delay.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.initial_delay.is_zero() {
            return Err(CoreError::Validation(
                "Initial backoff delay must be greater than zero".to_string(),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(CoreError::Validation(
                "Maximum backoff delay must not be below the initial delay".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(CoreError::Validation(
                "Backoff multiplier must be a finite number >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`BackoffConfig::max_delay`].
pub fn next_delay(current: Duration, config: &BackoffConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Stateful delay sequence for one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial_delay;
        Self {
            config,
            current,
            failures: 0,
        }
    }

    /// Delay to wait before the next attempt, without advancing.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failed attempt. Returns the delay to sleep now and grows
    /// the delay for the attempt after.
    pub fn fail(&mut self) -> Duration {
        let delay = self.current;
        self.failures = self.failures.saturating_add(1);
        self.current = next_delay(self.current, &self.config);
        delay
    }

    /// Return to the initial delay after a success.
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.failures = 0;
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}
