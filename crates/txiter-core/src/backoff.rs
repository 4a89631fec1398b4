//! Retry backoff policy.
//!
//! The source poller retries upstream fetch failures forever; the policy
//! only decides how long to wait between attempts. Leader write failures are
//! not governed by it: the backlog is retried on every sweep tick.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between attempts.
    Fixed {
        /// Delay duration.
        #[serde(with = "crate::humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff.
    Exponential {
        /// Initial delay.
        #[serde(with = "crate::humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "crate::humantime_serde")]
        max_delay: Duration,

        /// Multiplier for each retry (default: 10.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },

    /// Linear backoff.
    Linear {
        /// Initial delay.
        #[serde(with = "crate::humantime_serde")]
        initial_delay: Duration,

        /// Increment per retry.
        #[serde(with = "crate::humantime_serde")]
        increment: Duration,

        /// Maximum delay.
        #[serde(with = "crate::humantime_serde")]
        max_delay: Duration,
    },
}

const fn default_multiplier() -> f64 {
    10.0
}

impl Default for BackoffConfig {
    /// 10ms, 100ms, 1s, then capped at 1s.
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            multiplier: default_multiplier(),
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (1-based).
    ///
    /// Attempt `0` is treated like attempt `1`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                // Past 64 doublings every sane policy is at its cap already.
                #[allow(clippy::cast_possible_wrap)]
                let exponent = (attempt - 1).min(64) as i32;
                let delay_secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                if !delay_secs.is_finite() || delay_secs >= max_delay.as_secs_f64() {
                    return *max_delay;
                }
                Duration::from_secs_f64(delay_secs).min(*max_delay)
            },
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => {
                let delay = increment
                    .checked_mul(attempt - 1)
                    .and_then(|inc| initial_delay.checked_add(inc))
                    .unwrap_or(*max_delay);
                delay.min(*max_delay)
            },
        }
    }
}

/// Attempt counter paired with a [`BackoffConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Creates a fresh counter.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Records a failure and returns how long to wait before the next try.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.config.delay_for_attempt(self.attempt)
    }

    /// Resets the counter after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}
