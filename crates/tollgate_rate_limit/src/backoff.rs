//! Jittered exponential backoff.

use crate::RateLimitConfig;
use rand::Rng;
use std::time::Duration;

/// Delay before the next attempt after `failures` failures.
///
/// `base = min(initial * 2^failures, max)`, then a uniform jitter of
/// `± base * jitter_factor` is added. Never negative.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tollgate_rate_limit::{RateLimitConfig, backoff_delay};
///
/// let config = RateLimitConfig::builder().jitter_factor(0.0).build().unwrap();
/// assert_eq!(backoff_delay(&config, 3), Duration::from_secs(8));
/// assert_eq!(backoff_delay(&config, 20), Duration::from_secs(64));
/// ```
pub fn backoff_delay(config: &RateLimitConfig, failures: u32) -> Duration {
    let max = *config.max_retry_delay();
    // 2^64 already exceeds any sane max_retry_delay.
    let exponent = failures.min(64) as i32;
    let base = (config.initial_retry_delay() * 2f64.powi(exponent)).min(max);

    let jitter = base * config.jitter_factor();
    let delay = if jitter > 0.0 {
        base + rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        base
    };

    Duration::try_from_secs_f64(delay.max(0.0)).unwrap_or_default()
}

/// Delays between attempts of a single call, keyed by attempt index.
///
/// Yields `max_retries` delays, the n-th computed with `backoff_delay(config, n)`.
/// Usable directly as a `tokio_retry2` strategy.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    config: RateLimitConfig,
    attempt: u32,
}

impl BackoffSchedule {
    /// Schedule for `config`.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            config: config.clone(),
            attempt: 0,
        }
    }
}

impl Iterator for BackoffSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= *self.config.max_retries() {
            return None;
        }
        let delay = backoff_delay(&self.config, self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}
