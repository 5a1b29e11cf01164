//! 5-field cron pattern evaluation (`minute hour dom month dow`),
//! delegated to the `cron` crate's well-tested parser and iterator rather
//! than hand-rolled field matching.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::QueueError;

/// A parsed, validated cron pattern.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    pattern: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parse a standard 5-field pattern. Fails with
    /// [`QueueError::InvalidCron`] if the pattern has the wrong number of
    /// fields or the `cron` crate otherwise rejects it.
    pub fn parse(pattern: &str) -> Result<Self, QueueError> {
        let fields: Vec<&str> = pattern.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(QueueError::InvalidCron {
                pattern: pattern.to_string(),
                reason: format!("expected 5 fields, got {}", fields.len()),
            });
        }

        // The `cron` crate's grammar is seconds-first; prepend a fixed
        // "0" seconds field so the public 5-field contract in the spec
        // stays seconds-free.
        let six_field = format!("0 {pattern}");
        let schedule = cron::Schedule::from_str(&six_field).map_err(|e| QueueError::InvalidCron {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            pattern: pattern.to_string(),
            schedule,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The smallest instant strictly greater than `from` satisfying the
    /// pattern, or `None` if the schedule has no further occurrences.
    pub fn next(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn every_five_minutes() {
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 10, 2, 0).unwrap();
        let next = schedule.next(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 10, 5, 0).unwrap());
    }

    #[test]
    fn next_is_strictly_after() {
        let schedule = CronSchedule::parse("0 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let next = schedule.next(from).unwrap();
        assert!(next > from);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = CronSchedule::parse("* * * *").unwrap_err();
        assert!(matches!(err, QueueError::InvalidCron { .. }));
    }
}
