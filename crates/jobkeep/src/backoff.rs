//! Pure calculator from attempt number to retry delay. `attempt` is
//! 1-based: attempt 1 is the first retry after the original failing run.

use serde::{Deserialize, Serialize};

/// One hour, in milliseconds — the backoff ceiling regardless of kind.
pub const MAX_BACKOFF_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub base_delay_ms: i64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms: 1000,
        }
    }
}

impl BackoffPolicy {
    pub fn new(kind: BackoffKind, base_delay_ms: i64) -> Self {
        Self {
            kind,
            base_delay_ms,
        }
    }

    /// Delay in milliseconds for the given (1-based) attempt, capped at
    /// [`MAX_BACKOFF_MS`].
    pub fn delay_ms(&self, attempt: u32) -> i64 {
        let raw = match self.kind {
            BackoffKind::Fixed => self.base_delay_ms,
            BackoffKind::Exponential => {
                let exp = attempt.saturating_sub(1).min(62);
                self.base_delay_ms.saturating_mul(1i64 << exp)
            }
        };
        raw.min(MAX_BACKOFF_MS).max(0)
    }

    /// `now + delay(attempt)`.
    pub fn next_run_at(&self, attempt: u32, now_ms: i64) -> i64 {
        now_ms + self.delay_ms(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_and_caps() {
        let policy = BackoffPolicy::new(BackoffKind::Exponential, 1000);
        assert_eq!(policy.delay_ms(1), 1000);
        assert_eq!(policy.delay_ms(2), 2000);
        assert_eq!(policy.delay_ms(3), 4000);
        assert_eq!(policy.delay_ms(20), MAX_BACKOFF_MS);
    }

    #[test]
    fn fixed_is_constant() {
        let policy = BackoffPolicy::new(BackoffKind::Fixed, 1500);
        assert_eq!(policy.delay_ms(1), 1500);
        assert_eq!(policy.delay_ms(10), 1500);
    }

    #[test]
    fn next_run_at_adds_now() {
        let policy = BackoffPolicy::new(BackoffKind::Exponential, 1000);
        assert_eq!(policy.next_run_at(1, 5000), 6000);
    }
}
