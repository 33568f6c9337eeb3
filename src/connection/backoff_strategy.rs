use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential backoff for downstream reconnect attempts.
pub struct BackoffStrategy {
    config: BackoffConfig,
    current_attempt: usize,
}

impl BackoffStrategy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_attempt: 0,
        }
    }

    /// Next wait interval, or `None` once the attempts are exhausted.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.current_attempt >= self.config.max_retries {
            return None;
        }

        let interval = self.config.initial_interval.as_secs_f64()
            * self.config.multiplier.powi(self.current_attempt as i32);
        let interval =
            Duration::from_secs_f64(interval.min(self.config.max_interval.as_secs_f64()));

        self.current_attempt += 1;
        Some(interval)
    }

    /// Back to the initial interval after a successful reconnect.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
