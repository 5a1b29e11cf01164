//! Restart-safe recurrence.
//!
//! `jobkeep`'s own runtime arms each occurrence as a plain
//! `tokio::time::sleep` and only writes the next job row once that sleep
//! resolves — simple, but a crash mid-sleep loses the occurrence, since
//! nothing durable ever described it. [`PersistentRepeat`] closes that
//! gap: it persists the next occurrence as an ordinary `delayed` job
//! *before* sleeping, not after. A crash any time after that write still
//! leaves a real job row behind; once any queue recovers the same
//! storage, the scheduler's `delayed -> pending` promotion (driven purely
//! by `nextRunAt`, not by this crate) picks it up like any other delayed
//! job. The in-process timer here exists only to arm the occurrence
//! *after* the one just persisted — it is not what keeps the current one
//! alive.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use jobkeep::error::QueueError;
use jobkeep::job::{now_ms, Job};
use jobkeep::repeat::next_occurrence_ms;
use jobkeep::storage::Storage;

/// Handle to one armed recurrence series. Dropping it does not stop the
/// series; call [`RepeatHandle::cancel`] or let the whole process exit.
pub struct RepeatHandle {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl RepeatHandle {
    pub fn cancel(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

pub struct PersistentRepeat<S: Storage + ?Sized> {
    storage: Arc<S>,
}

impl<S: Storage + ?Sized + 'static> PersistentRepeat<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Arms `basis` (a job that already carries a `repeat_config`) for
    /// restart-safe recurrence. Returns `None` if the schedule has no
    /// further occurrences from `basis`'s current `repeat_count`.
    pub fn arm(&self, basis: Job) -> Option<RepeatHandle> {
        let repeat = basis.repeat_config.clone()?;
        next_occurrence_ms(&repeat, basis.repeat_count, now_ms())?;

        let storage = self.storage.clone();
        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();
        let task = tokio::spawn(run(storage, basis, cancel_for_task));
        Some(RepeatHandle { task, cancel })
    }

    /// Re-arms every non-terminal job in storage that carries a
    /// `repeat_config`, for use right after crash recovery.
    pub async fn rearm_all(&self) -> Result<Vec<RepeatHandle>, QueueError> {
        let mut handles = Vec::new();
        for job in self.storage.get_all_jobs().await? {
            if job.repeat_config.is_some() && !job.is_terminal() {
                if let Some(handle) = self.arm(job) {
                    handles.push(handle);
                }
            }
        }
        Ok(handles)
    }
}

async fn run<S: Storage + ?Sized>(storage: Arc<S>, mut basis: Job, cancel: CancellationToken) {
    loop {
        let Some(repeat) = basis.repeat_config.clone() else { return };
        let now = now_ms();
        let Some(next_at) = next_occurrence_ms(&repeat, basis.repeat_count, now) else {
            return;
        };

        let clone_job = basis.next_occurrence(next_at, now);
        if let Err(e) = storage.add_job(clone_job.clone()).await {
            warn!(job_id = %clone_job.id, error = %e, "failed to persist next occurrence, recurrence series stops");
            return;
        }

        let delay = (next_at - now_ms()).max(0) as u64;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
        }
        basis = clone_job;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobkeep::job::{JobOptions, JobStatus, RepeatConfig, RepeatSchedule};
    use jobkeep::storage::MemoryStorage;
    use serde_json::json;

    fn repeating_job() -> Job {
        Job::new(
            "tick",
            json!({}),
            3,
            JobOptions {
                repeat: Some(RepeatConfig {
                    schedule: RepeatSchedule::Every(20),
                    limit: Some(2),
                    start_date: None,
                    end_date: None,
                }),
                ..Default::default()
            },
            now_ms(),
        )
    }

    #[tokio::test]
    async fn arm_persists_next_occurrence_before_it_fires() {
        let storage = Arc::new(MemoryStorage::new());
        storage.initialize().await.unwrap();
        let basis = repeating_job();

        let repeat = PersistentRepeat::new(storage.clone());
        let handle = repeat.arm(basis).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let jobs = storage.get_all_jobs().await.unwrap();
        assert!(jobs.iter().any(|j| j.status == JobStatus::Delayed || j.status == JobStatus::Pending));

        handle.cancel();
    }

    #[tokio::test]
    async fn exhausted_limit_arms_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        storage.initialize().await.unwrap();
        let mut basis = repeating_job();
        basis.repeat_count = 2; // == limit

        let repeat = PersistentRepeat::new(storage.clone());
        assert!(repeat.arm(basis).is_none());
    }
}
