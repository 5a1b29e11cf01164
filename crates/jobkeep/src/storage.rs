//! The `Storage` contract and its built-in in-memory backend. The
//! file-backed backend lives in the sibling `jobkeep-file` crate so a
//! caller pulls in filesystem durability only when it wants it.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::job::{Job, JobId, JobStatus};

/// Contract shared by every storage backend. Implementations own
/// durability and crash recovery; the runtime only ever sees the
/// snapshots this trait returns.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Opens the backend and performs crash recovery. Called once before
    /// any other method.
    async fn initialize(&self) -> Result<(), QueueError>;

    /// Inserts a job. Fails with [`QueueError::StorageNotFound`]-adjacent
    /// semantics are not applicable here; a duplicate id is a caller bug
    /// and returns [`QueueError::ConfigInvalid`].
    async fn add_job(&self, job: Job) -> Result<(), QueueError>;

    /// Replaces a job. Fails with [`QueueError::StorageNotFound`] if the
    /// id is absent.
    async fn update_job(&self, job: Job) -> Result<(), QueueError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    /// Snapshot of the entire main store.
    async fn get_all_jobs(&self) -> Result<Vec<Job>, QueueError>;

    /// All main-store jobs with `status=pending && next_run_at <= now`,
    /// ordered by `(priority desc, next_run_at asc)`. Defensive copies.
    async fn get_pending_jobs(&self, now_ms: i64) -> Result<Vec<Job>, QueueError>;

    /// All main-store jobs with `status=waiting`. Used by the runtime to
    /// re-check dependency satisfaction without scanning completed or
    /// processing jobs too.
    async fn get_waiting_jobs(&self) -> Result<Vec<Job>, QueueError> {
        Ok(self
            .get_all_jobs()
            .await?
            .into_iter()
            .filter(|j| j.status == JobStatus::Waiting)
            .collect())
    }

    /// Ids of `waiting` jobs whose `depends_on` includes `id`. The default
    /// implementation scans every waiting job; backends that maintain a
    /// dependents index (see `SPEC_FULL.md` §4.4) override this so a
    /// completion only looks up the jobs it could possibly unblock instead
    /// of scanning the whole waiting set.
    async fn get_dependents(&self, id: JobId) -> Result<Vec<JobId>, QueueError> {
        Ok(self
            .get_waiting_jobs()
            .await?
            .into_iter()
            .filter(|j| j.depends_on.contains(&id))
            .map(|j| j.id)
            .collect())
    }

    /// All main-store jobs with `status=delayed` whose `next_run_at` has
    /// passed. Used by the scheduler to promote them to `pending` per the
    /// `delayed -> pending when now >= nextRunAt` status rule.
    async fn get_due_delayed_jobs(&self, now_ms: i64) -> Result<Vec<Job>, QueueError> {
        Ok(self
            .get_all_jobs()
            .await?
            .into_iter()
            .filter(|j| j.status == JobStatus::Delayed && j.next_run_at <= now_ms)
            .collect())
    }

    /// All main-store jobs with `status=processing`. Used by the stalled
    /// sweeper.
    async fn get_processing_jobs(&self) -> Result<Vec<Job>, QueueError> {
        Ok(self
            .get_all_jobs()
            .await?
            .into_iter()
            .filter(|j| j.status == JobStatus::Processing)
            .collect())
    }

    /// Atomically removes from the main store and inserts into the DLQ.
    async fn move_to_dead_letter(&self, job: Job) -> Result<(), QueueError>;

    /// Snapshot of the DLQ.
    async fn get_failed_jobs(&self) -> Result<Vec<Job>, QueueError>;

    /// Removes and returns the job from the DLQ, if present.
    async fn remove_from_dead_letter(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    /// Removes a `completed` job from the main store. Used by `clean`.
    async fn remove_job(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    /// Flushes and releases resources. Idempotent.
    async fn close(&self) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingKey {
    priority_rev: Reverse<i32>,
    next_run_at: i64,
    id: JobId,
}

/// In-memory `Storage` implementation. No persistence: `initialize` and
/// `close` are no-ops. Maintains a sorted index of pending jobs so the
/// scheduler's 200ms tick does not need to scan the whole store.
#[derive(Default)]
pub struct MemoryStorage {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letter: RwLock<HashMap<JobId, Job>>,
    pending_index: RwLock<std::collections::BTreeSet<PendingKey>>,
    /// Maps a dependency id to the waiting jobs that name it in
    /// `depends_on`, so a completion looks up only its dependents instead
    /// of scanning every waiting job (`SPEC_FULL.md` §4.4).
    dependents_index: RwLock<HashMap<JobId, HashSet<JobId>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), QueueError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            Err(QueueError::StorageClosed)
        } else {
            Ok(())
        }
    }

    fn index_key(job: &Job) -> PendingKey {
        PendingKey {
            priority_rev: Reverse(job.priority),
            next_run_at: job.next_run_at,
            id: job.id,
        }
    }

    fn reindex(&self, job: &Job) {
        let mut index = self.pending_index.write().unwrap();
        index.retain(|k| k.id != job.id);
        if job.status == JobStatus::Pending {
            index.insert(Self::index_key(job));
        }
    }

    fn deindex(&self, id: JobId) {
        let mut index = self.pending_index.write().unwrap();
        index.retain(|k| k.id != id);
    }

    fn reindex_dependents(&self, job: &Job) {
        let mut index = self.dependents_index.write().unwrap();
        for dep in &job.depends_on {
            if let Some(set) = index.get_mut(dep) {
                set.remove(&job.id);
            }
        }
        if job.status == JobStatus::Waiting {
            for dep in &job.depends_on {
                index.entry(*dep).or_default().insert(job.id);
            }
        }
    }

    fn deindex_dependents(&self, job: &Job) {
        let mut index = self.dependents_index.write().unwrap();
        for dep in &job.depends_on {
            if let Some(set) = index.get_mut(dep) {
                set.remove(&job.id);
            }
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn initialize(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn add_job(&self, job: Job) -> Result<(), QueueError> {
        self.check_open()?;
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(QueueError::ConfigInvalid(format!(
                "job {} already exists",
                job.id
            )));
        }
        self.reindex(&job);
        self.reindex_dependents(&job);
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn update_job(&self, job: Job) -> Result<(), QueueError> {
        self.check_open()?;
        let mut jobs = self.jobs.write().unwrap();
        if !jobs.contains_key(&job.id) {
            return Err(QueueError::StorageNotFound(job.id));
        }
        self.reindex(&job);
        self.reindex_dependents(&job);
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_dependents(&self, id: JobId) -> Result<Vec<JobId>, QueueError> {
        self.check_open()?;
        Ok(self
            .dependents_index
            .read()
            .unwrap()
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.check_open()?;
        Ok(self.jobs.read().unwrap().get(&id).cloned())
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.check_open()?;
        Ok(self.jobs.read().unwrap().values().cloned().collect())
    }

    async fn get_pending_jobs(&self, now_ms: i64) -> Result<Vec<Job>, QueueError> {
        self.check_open()?;
        let index = self.pending_index.read().unwrap();
        let jobs = self.jobs.read().unwrap();
        Ok(index
            .iter()
            .filter(|k| k.next_run_at <= now_ms)
            .filter_map(|k| jobs.get(&k.id).cloned())
            .collect())
    }

    async fn move_to_dead_letter(&self, job: Job) -> Result<(), QueueError> {
        self.check_open()?;
        let mut jobs = self.jobs.write().unwrap();
        jobs.remove(&job.id);
        self.deindex(job.id);
        self.deindex_dependents(&job);
        drop(jobs);
        self.dead_letter.write().unwrap().insert(job.id, job);
        Ok(())
    }

    async fn get_failed_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.check_open()?;
        Ok(self.dead_letter.read().unwrap().values().cloned().collect())
    }

    async fn remove_from_dead_letter(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.check_open()?;
        Ok(self.dead_letter.write().unwrap().remove(&id))
    }

    async fn remove_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.check_open()?;
        self.deindex(id);
        let removed = self.jobs.write().unwrap().remove(&id);
        if let Some(job) = &removed {
            self.deindex_dependents(job);
        }
        Ok(removed)
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(id: JobId, priority: i32, next_run_at: i64) -> Job {
        Job {
            id,
            handler: "noop".into(),
            payload: json!({}),
            status: JobStatus::Pending,
            priority,
            attempts: 0,
            max_attempts: 3,
            progress: 0,
            next_run_at,
            delay_ms: 0,
            depends_on: vec![],
            repeat_config: None,
            repeat_count: 0,
            result: None,
            error: None,
            created_at: 0,
            updated_at: 0,
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn add_then_get() {
        let storage = MemoryStorage::new();
        let id = JobId::new();
        storage.add_job(job(id, 0, 0)).await.unwrap();
        assert!(storage.get_job(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn add_duplicate_fails() {
        let storage = MemoryStorage::new();
        let id = JobId::new();
        storage.add_job(job(id, 0, 0)).await.unwrap();
        assert!(storage.add_job(job(id, 0, 0)).await.is_err());
    }

    #[tokio::test]
    async fn update_missing_fails() {
        let storage = MemoryStorage::new();
        assert!(storage.update_job(job(JobId::new(), 0, 0)).await.is_err());
    }

    #[tokio::test]
    async fn pending_jobs_ordered_by_priority_then_time() {
        let storage = MemoryStorage::new();
        let low = JobId::new();
        let high = JobId::new();
        storage.add_job(job(low, 0, 100)).await.unwrap();
        storage.add_job(job(high, 5, 200)).await.unwrap();

        let pending = storage.get_pending_jobs(1000).await.unwrap();
        assert_eq!(pending[0].id, high);
        assert_eq!(pending[1].id, low);
    }

    #[tokio::test]
    async fn move_to_dead_letter_removes_from_main() {
        let storage = MemoryStorage::new();
        let id = JobId::new();
        let j = job(id, 0, 0);
        storage.add_job(j.clone()).await.unwrap();
        storage.move_to_dead_letter(j).await.unwrap();

        assert!(storage.get_job(id).await.unwrap().is_none());
        assert_eq!(storage.get_failed_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_dependents_tracks_waiting_jobs_and_clears_on_promotion() {
        let storage = MemoryStorage::new();
        let dep = JobId::new();
        let waiter = JobId::new();
        storage.add_job(job(dep, 0, 0)).await.unwrap();
        let mut w = job(waiter, 0, 0);
        w.status = JobStatus::Waiting;
        w.depends_on = vec![dep];
        storage.add_job(w.clone()).await.unwrap();

        assert_eq!(storage.get_dependents(dep).await.unwrap(), vec![waiter]);

        w.status = JobStatus::Pending;
        storage.update_job(w).await.unwrap();
        assert!(storage.get_dependents(dep).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_dependents_clears_when_dependent_is_removed() {
        let storage = MemoryStorage::new();
        let dep = JobId::new();
        let waiter = JobId::new();
        let mut w = job(waiter, 0, 0);
        w.status = JobStatus::Waiting;
        w.depends_on = vec![dep];
        storage.add_job(w).await.unwrap();
        assert_eq!(storage.get_dependents(dep).await.unwrap(), vec![waiter]);

        storage.remove_job(waiter).await.unwrap();
        assert!(storage.get_dependents(dep).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_storage_rejects_writes() {
        let storage = MemoryStorage::new();
        storage.close().await.unwrap();
        assert!(matches!(
            storage.add_job(job(JobId::new(), 0, 0)).await,
            Err(QueueError::StorageClosed)
        ));
    }
}
