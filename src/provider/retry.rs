//! Retry with exponential backoff for throttled provider calls
//!
//! Only errors reporting `is_recoverable()` are retried; everything else
//! surfaces immediately. One policy covers every provider call site.

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, StratusError};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts, counting the initial one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on the delay between retries
    pub max_delay: Duration,
    /// Multiplier applied per retry
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0); 0.2 spreads each delay by ±20%
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
}

/// Executes operations, retrying recoverable failures with backoff.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay for a given retry (0-indexed: first retry is attempt 0).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.config.initial_delay.as_millis() as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.config.max_delay.as_millis() as f64);

        let jittered = if self.config.jitter > 0.0 {
            let range = capped * self.config.jitter;
            let offset = rand::random::<f64>() * range * 2.0 - range;
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(jittered as u64)
    }

    /// Run `operation`, retrying while it returns recoverable errors.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error: Option<StratusError> = None;

        for attempt in 0..self.config.max_attempts {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !e.is_recoverable() {
                        return Err(e);
                    }
                    last_error = Some(e);
                    if attempt + 1 < self.config.max_attempts {
                        tokio::time::sleep(self.calculate_delay(attempt)).await;
                    }
                }
            }
        }

        Err(StratusError::RetryExhausted {
            attempts: self.config.max_attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }
}
