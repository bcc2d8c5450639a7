//! Reconnection configuration and exponential backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on the exponential part of the delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Maximum random jitter as a fraction of the base delay.
    pub jitter_ratio: f64,
    /// Number of scheduled reconnections before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ratio: 0.1,
            max_attempts: 25,
        }
    }
}

impl ReconnectConfig {
    /// Delay for a given number of previous attempts, without jitter.
    ///
    /// `min(max_delay, base_delay * 2^attempts)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempts).unwrap_or(u64::MAX);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Largest jitter that may be added to a delay.
    #[must_use]
    pub fn max_jitter(&self) -> Duration {
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        Duration::from_millis((self.base_delay_ms as f64 * ratio) as u64)
    }

    /// Check if another reconnection may be scheduled.
    #[must_use]
    pub const fn should_reconnect(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Tracks reconnection attempts and computes backoff delays.
#[derive(Debug, Clone)]
pub struct ReconnectScheduler {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectScheduler {
    /// Create a scheduler with no attempts recorded.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Attempts scheduled since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the attempt cap has been reached.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        !self.config.should_reconnect(self.attempts)
    }

    /// Forget previous attempts. Called on a successful open and by `reconnect()`.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Schedule the next attempt using thread-local randomness for jitter.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MaxAttemptsExceeded`] once the cap is reached.
    pub fn schedule(&mut self) -> Result<Duration, GatewayError> {
        self.schedule_with(&mut rand::thread_rng())
    }

    /// Schedule the next attempt, drawing jitter from `rng`.
    ///
    /// Every successful call counts as one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MaxAttemptsExceeded`] once the cap is reached.
    pub fn schedule_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<Duration, GatewayError> {
        if self.is_exhausted() {
            return Err(GatewayError::MaxAttemptsExceeded {
                attempts: self.attempts,
            });
        }

        let base = self.config.delay_for_attempt(self.attempts);
        let max_jitter = self.config.max_jitter().as_millis() as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rng.gen_range(0..=max_jitter)
        };

        self.attempts += 1;
        Ok(base + Duration::from_millis(jitter))
    }
}
