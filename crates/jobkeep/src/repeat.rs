//! In-memory recurrence calculation shared by the runtime's timer-arming
//! loop. A persisted variant that survives a restart lives in the sibling
//! `jobkeep-repeat` crate; this module only computes "when does the next
//! occurrence fall", it does not itself persist anything.

use chrono::{TimeZone, Utc};

use crate::cron::CronSchedule;
use crate::job::{RepeatConfig, RepeatSchedule};

/// The next instant (ms epoch) a repeating job should fire, or `None` if
/// the schedule has no further occurrences given `repeat_count` and the
/// configured `limit`/`end_date`.
pub fn next_occurrence_ms(repeat: &RepeatConfig, repeat_count: u32, now_ms: i64) -> Option<i64> {
    if let Some(limit) = repeat.limit {
        if repeat_count >= limit {
            return None;
        }
    }

    let mut candidate = match &repeat.schedule {
        RepeatSchedule::Every(interval_ms) => now_ms + (*interval_ms).max(0),
        RepeatSchedule::Pattern(pattern) => {
            let schedule = CronSchedule::parse(pattern).ok()?;
            let from = Utc.timestamp_millis_opt(now_ms).single()?;
            schedule.next(from)?.timestamp_millis()
        }
    };

    if let Some(start) = repeat.start_date {
        candidate = candidate.max(start);
    }
    if let Some(end) = repeat.end_date {
        if candidate >= end {
            return None;
        }
    }

    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_adds_to_now() {
        let repeat = RepeatConfig {
            schedule: RepeatSchedule::Every(5_000),
            limit: None,
            start_date: None,
            end_date: None,
        };
        assert_eq!(next_occurrence_ms(&repeat, 0, 1_000), Some(6_000));
    }

    #[test]
    fn limit_stops_further_occurrences() {
        let repeat = RepeatConfig {
            schedule: RepeatSchedule::Every(1_000),
            limit: Some(3),
            start_date: None,
            end_date: None,
        };
        assert_eq!(next_occurrence_ms(&repeat, 3, 0), None);
        assert!(next_occurrence_ms(&repeat, 2, 0).is_some());
    }

    #[test]
    fn end_date_stops_occurrence_at_or_after_it() {
        let repeat = RepeatConfig {
            schedule: RepeatSchedule::Every(1_000),
            limit: None,
            start_date: None,
            end_date: Some(500),
        };
        assert_eq!(next_occurrence_ms(&repeat, 0, 0), None);
    }

    #[test]
    fn start_date_clamps_candidate_forward() {
        let repeat = RepeatConfig {
            schedule: RepeatSchedule::Every(1_000),
            limit: None,
            start_date: Some(10_000),
            end_date: None,
        };
        assert_eq!(next_occurrence_ms(&repeat, 0, 0), Some(10_000));
    }
}
