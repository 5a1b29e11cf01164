//! Construction-time configuration. Validated eagerly so a misconfigured
//! queue fails at `QueueBuilder::build` rather than at some later `add`.

use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::QueueError;
use crate::ratelimit::RateLimiterConfig;

/// Default stalled-detection interval: 30 seconds.
pub const DEFAULT_STALLED_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub retry: RetryConfig,
    pub rate_limiter: Option<RateLimiterConfig>,
    pub stalled_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retry: RetryConfig::default(),
            rate_limiter: None,
            stalled_interval: DEFAULT_STALLED_INTERVAL,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.concurrency == 0 {
            return Err(QueueError::ConfigInvalid(
                "concurrency must be a positive integer".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(QueueError::ConfigInvalid(
                "retry.maxAttempts must be a positive integer".into(),
            ));
        }
        if let Some(limiter) = &self.rate_limiter {
            if limiter.max == 0 || limiter.duration_ms <= 0 {
                return Err(QueueError::ConfigInvalid(
                    "rateLimiter.max and rateLimiter.duration must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}
