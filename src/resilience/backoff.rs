//! Exponential backoff with jitter for reconnect loops.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// 0.0 to 1.0
    pub jitter_factor: f64,
    /// Stop after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.2,
            max_attempts: None,
        }
    }
}

pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    ///
    /// The first delay is `initial_delay_ms`; each following one is multiplied
    /// and capped at `max_delay_ms` before jitter is applied.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }

        let exponent = self.attempt.min(32) as i32;
        self.attempt += 1;

        let base = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = base.min(self.config.max_delay_ms as f64);

        let delay = if self.config.jitter_factor > 0.0 {
            let range = capped * self.config.jitter_factor;
            let jitter = rand::rng().random_range(-range..=range);
            (capped + jitter).max(1.0)
        } else {
            capped.max(1.0)
        };

        Some(Duration::from_millis(delay as u64))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}
