//! Fixed-window token bucket. Despite the name this is not a true token
//! bucket: the window resets to full capacity rather than dripping tokens
//! in continuously. See the Design Note on rate limiter semantics — this
//! is a deliberate compatibility choice, not an oversight.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub max: u32,
    pub duration_ms: i64,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    max: u32,
    duration_ms: i64,
    tokens: u32,
    window_start_ms: i64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, now_ms: i64) -> Self {
        Self {
            max: config.max,
            duration_ms: config.duration_ms,
            tokens: config.max,
            window_start_ms: now_ms,
        }
    }

    /// Non-blocking: resets the window if elapsed, then tries to take one
    /// token. Returns `false` without blocking if none remain.
    pub fn consume(&mut self, now_ms: i64) -> bool {
        if now_ms - self.window_start_ms >= self.duration_ms {
            self.tokens = self.max;
            self.window_start_ms = now_ms;
        }

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}
