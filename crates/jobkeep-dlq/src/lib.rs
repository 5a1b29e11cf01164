//! A thin dead-letter-queue projection over any [`Storage`] backend.
//!
//! `jobkeep::Queue` already exposes `get_failed_jobs`/`reprocess_failed`
//! for callers embedding a full queue. `DeadLetterView` is for the other
//! case: a separate admin tool, CLI or dashboard that only wants to
//! inspect or requeue dead-lettered jobs against the same storage,
//! without standing up workers or a scheduler.

use std::sync::Arc;

use jobkeep::error::QueueError;
use jobkeep::job::{now_ms, Job, JobId};
use jobkeep::storage::Storage;

pub struct DeadLetterView<S: Storage + ?Sized> {
    storage: Arc<S>,
}

impl<S: Storage + ?Sized> DeadLetterView<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    pub async fn list(&self) -> Result<Vec<Job>, QueueError> {
        self.storage.get_failed_jobs().await
    }

    pub async fn count(&self) -> Result<usize, QueueError> {
        Ok(self.storage.get_failed_jobs().await?.len())
    }

    /// Moves a job from the dead letter store back onto the main store,
    /// reset for a fresh attempt. Returns `None` if no such job is dead
    /// lettered.
    pub async fn reprocess(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let Some(job) = self.storage.remove_from_dead_letter(id).await? else {
            return Ok(None);
        };
        let reset = job.reset_for_reprocess(now_ms());
        self.storage.add_job(reset.clone()).await?;
        Ok(Some(reset))
    }

    /// Permanently discards a dead-lettered job without requeueing it.
    pub async fn discard(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.storage.remove_from_dead_letter(id).await
    }

    /// Discards every dead-lettered job. Returns the number removed.
    pub async fn clear(&self) -> Result<usize, QueueError> {
        let jobs = self.storage.get_failed_jobs().await?;
        let mut removed = 0;
        for job in jobs {
            if self.storage.remove_from_dead_letter(job.id).await?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobkeep::job::{JobOptions, JobStatus};
    use jobkeep::storage::MemoryStorage;
    use serde_json::json;

    fn dead_job(id: JobId) -> Job {
        let mut j = Job::new(
            "noop",
            json!({}),
            1,
            JobOptions { job_id: Some(id), ..Default::default() },
            0,
        );
        j.status = JobStatus::Failed;
        j.attempts = 1;
        j
    }

    #[tokio::test]
    async fn reprocess_moves_job_back_to_main_store() {
        let storage = Arc::new(MemoryStorage::new());
        storage.initialize().await.unwrap();
        let id = JobId::new();
        storage.move_to_dead_letter(dead_job(id)).await.unwrap();

        let view = DeadLetterView::new(storage.clone());
        assert_eq!(view.count().await.unwrap(), 1);

        let reset = view.reprocess(id).await.unwrap().unwrap();
        assert_eq!(reset.status, JobStatus::Pending);
        assert_eq!(reset.attempts, 0);
        assert_eq!(view.count().await.unwrap(), 0);
        assert!(storage.get_job(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_discards_every_dead_lettered_job() {
        let storage = Arc::new(MemoryStorage::new());
        storage.initialize().await.unwrap();
        storage.move_to_dead_letter(dead_job(JobId::new())).await.unwrap();
        storage.move_to_dead_letter(dead_job(JobId::new())).await.unwrap();

        let view = DeadLetterView::new(storage.clone());
        assert_eq!(view.clear().await.unwrap(), 2);
        assert_eq!(view.count().await.unwrap(), 0);
    }
}
