//! The job record: the unit of work that flows through storage, the
//! scheduler and a worker.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable, unique job identifier. Caller-supplied or generated (random
/// 128-bit) at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// Current lifecycle position of a job. See the status lifecycle table:
/// a job moves strictly through these states; `processing` is the only
/// state that can fan out to three different successors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Delayed,
    Pending,
    Processing,
    Completed,
    Failed,
    Stalled,
}

/// One occurrence of a recurring schedule: either a fixed interval or a
/// 5-field cron pattern, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatSchedule {
    /// Fire again `every` milliseconds after the previous occurrence.
    Every(i64),
    /// Fire on the next instant the 5-field cron pattern selects.
    Pattern(String),
}

/// Recurrence configuration for a repeating job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatConfig {
    pub schedule: RepeatSchedule,
    /// Stop arming further occurrences once `repeat_count` reaches this.
    pub limit: Option<u32>,
    /// No occurrence fires before this instant (ms epoch).
    pub start_date: Option<i64>,
    /// No occurrence fires at or after this instant (ms epoch).
    pub end_date: Option<i64>,
}

/// Caller-supplied options at `add` time. Everything here has a sensible
/// default; only `handler` and `payload` are required to construct a job.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub job_id: Option<JobId>,
    pub priority: i32,
    pub delay_ms: i64,
    pub depends_on: Vec<JobId>,
    pub repeat: Option<RepeatConfig>,
    pub max_attempts: Option<u32>,
}

/// The unit of work. `payload` and `result`/`error` are opaque JSON so the
/// queue itself stays agnostic to what a handler actually does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Name of the registered processor this job dispatches to.
    pub handler: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    /// 0..=100, clamped.
    pub progress: u8,
    /// Earliest instant (ms epoch) at which this job may run.
    pub next_run_at: i64,
    /// Initial delay at creation time (ms).
    pub delay_ms: i64,
    /// Job ids that must be `completed` before this one may dispatch.
    pub depends_on: Vec<JobId>,
    pub repeat_config: Option<RepeatConfig>,
    pub repeat_count: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Job {
    /// Construct a job with the initial status determined from its
    /// options, per the status lifecycle rule:
    /// `delay>0 -> delayed; else dependsOn non-empty -> waiting; else -> pending`.
    pub fn new(
        handler: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
        options: JobOptions,
        now_ms: i64,
    ) -> Self {
        let depends_on: Vec<JobId> = options
            .depends_on
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let status = if options.delay_ms > 0 {
            JobStatus::Delayed
        } else if !depends_on.is_empty() {
            JobStatus::Waiting
        } else {
            JobStatus::Pending
        };

        let next_run_at = now_ms + options.delay_ms.max(0);

        Self {
            id: options.job_id.unwrap_or_default(),
            handler: handler.into(),
            payload,
            status,
            priority: options.priority,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(max_attempts),
            progress: 0,
            next_run_at,
            delay_ms: options.delay_ms,
            depends_on,
            repeat_config: options.repeat,
            repeat_count: 0,
            result: None,
            error: None,
            created_at: now_ms,
            updated_at: now_ms,
            started_at: None,
            completed_at: None,
        }
    }

    /// Build the clone that arms the next occurrence of a repeating job:
    /// fresh id, zeroed attempts and progress, `repeat_count` incremented.
    pub fn next_occurrence(&self, next_run_at: i64, now_ms: i64) -> Self {
        Self {
            id: JobId::new(),
            handler: self.handler.clone(),
            payload: self.payload.clone(),
            status: JobStatus::Delayed,
            priority: self.priority,
            attempts: 0,
            max_attempts: self.max_attempts,
            progress: 0,
            next_run_at,
            delay_ms: self.delay_ms,
            depends_on: Vec::new(),
            repeat_config: self.repeat_config.clone(),
            repeat_count: self.repeat_count + 1,
            result: None,
            error: None,
            created_at: now_ms,
            updated_at: now_ms,
            started_at: None,
            completed_at: None,
        }
    }

    /// Reset copy used by `DeadLetterView::remove` to re-enqueue a DLQ job.
    pub fn reset_for_reprocess(&self, now_ms: i64) -> Self {
        let mut job = self.clone();
        job.attempts = 0;
        job.status = JobStatus::Pending;
        job.next_run_at = now_ms;
        job.progress = 0;
        job.result = None;
        job.error = None;
        job.started_at = None;
        job.completed_at = None;
        job.updated_at = now_ms;
        job
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Milliseconds since the Unix epoch, per the spec's timestamp convention.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
