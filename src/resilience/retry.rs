// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff and jitter.
//!
//! Provides configurable retry behavior for transient failures.
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use failover_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Replay: base 1s, factor 2, cap 30s, 5 attempts
//! let replay = RetryConfig::replay();
//! assert_eq!(replay.max_retries, Some(5));
//! assert_eq!(replay.max_delay, Duration::from_secs(30));
//!
//! // Without jitter the schedule is exact
//! let exact = RetryConfig { jitter: false, ..RetryConfig::replay() };
//! assert_eq!(exact.delay_for(1), Duration::from_secs(1));
//! assert_eq!(exact.delay_for(3), Duration::from_secs(4));
//! assert_eq!(exact.delay_for(10), Duration::from_secs(30));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for opening the durable store
/// - [`RetryConfig::replay()`] - Offline queue replay schedule
/// - [`RetryConfig::query()`] - Quick retry for individual store queries
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
    /// Randomize each delay within [delay/2, delay] ("equal jitter")
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::replay()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: false,
        }
    }

    /// Replay schedule for queued offline writes.
    #[must_use]
    pub fn replay() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: true,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: false,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            jitter: false,
        }
    }

    /// Whether another attempt is allowed after `failures` failed attempts.
    #[must_use]
    pub fn allows_another(&self, failures: usize) -> bool {
        self.max_retries.map_or(true, |max| failures < max)
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64()).max(0.0);
        let delay = Duration::from_secs_f64(capped);
        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            let spread = delay - half;
            half + spread.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
        } else {
            delay
        }
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts: usize = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !config.allows_another(attempts) {
                    return Err(err);
                }

                let delay = config.delay_for(attempts as u32);
                match config.max_retries {
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    ),
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    ),
                }

                sleep(delay).await;
            }
        }
    }
}
