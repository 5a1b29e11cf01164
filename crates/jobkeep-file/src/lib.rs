//! Append-only file-log [`Storage`] backend.
//!
//! Two logs live side by side: the main job log and a dead-letter log
//! whose path is derived from it (`queue.log` → `queue-dead-letter.log`).
//! Each line is a plain JSON job record (no wrapper, no tombstone);
//! replaying a log in order and keeping the last record per job id
//! reconstructs the current table, since a later line for the same id
//! supersedes an earlier one. Removal isn't represented in the log format
//! itself — removing a job drops it from the in-memory table and
//! compacts the file immediately, so the line disappears on the next
//! read rather than being marked deleted. Crash recovery re-arms any job
//! caught mid-`processing` back to `pending` with `attempts` bumped, on
//! the assumption that whatever held it never got to report success or
//! failure. Both logs are compacted right after recovery too, so neither
//! file grows without bound across the lifetime of a long-running
//! process.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use jobkeep::error::QueueError;
use jobkeep::job::{now_ms, Job, JobId, JobStatus};
use jobkeep::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingKey {
    priority_rev: Reverse<i32>,
    next_run_at: i64,
    id: JobId,
}

fn pending_key(job: &Job) -> PendingKey {
    PendingKey {
        priority_rev: Reverse(job.priority),
        next_run_at: job.next_run_at,
        id: job.id,
    }
}

/// File-backed `Storage`. Opened against a main log path; the
/// dead-letter log sits alongside it with `-dead-letter` inserted before
/// the extension.
pub struct FileStorage {
    main_path: PathBuf,
    dlq_path: PathBuf,
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letter: RwLock<HashMap<JobId, Job>>,
    pending_index: RwLock<BTreeSet<PendingKey>>,
    /// Maps a dependency id to the waiting jobs that name it in
    /// `depends_on`; see `MemoryStorage`'s identical index and
    /// `SPEC_FULL.md` §4.4.
    dependents_index: RwLock<HashMap<JobId, HashSet<JobId>>>,
    main_file: Mutex<Option<File>>,
    dlq_file: Mutex<Option<File>>,
    closed: AtomicBool,
}

impl FileStorage {
    pub fn new(main_path: impl AsRef<Path>) -> Self {
        let main_path = main_path.as_ref().to_path_buf();
        let dlq_path = dead_letter_path(&main_path);
        Self {
            main_path,
            dlq_path,
            jobs: RwLock::new(HashMap::new()),
            dead_letter: RwLock::new(HashMap::new()),
            pending_index: RwLock::new(BTreeSet::new()),
            dependents_index: RwLock::new(HashMap::new()),
            main_file: Mutex::new(None),
            dlq_file: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(QueueError::StorageClosed)
        } else {
            Ok(())
        }
    }

    async fn reindex(&self, job: &Job) {
        let mut index = self.pending_index.write().await;
        index.retain(|k| k.id != job.id);
        if job.status == JobStatus::Pending {
            index.insert(pending_key(job));
        }
    }

    async fn deindex(&self, id: JobId) {
        self.pending_index.write().await.retain(|k| k.id != id);
    }

    async fn reindex_dependents(&self, job: &Job) {
        let mut index = self.dependents_index.write().await;
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

    async fn deindex_dependents(&self, job: &Job) {
        let mut index = self.dependents_index.write().await;
        for dep in &job.depends_on {
            if let Some(set) = index.get_mut(dep) {
                set.remove(&job.id);
            }
        }
    }

    async fn append(file: &Mutex<Option<File>>, job: &Job) -> Result<(), QueueError> {
        let mut guard = file.lock().await;
        let Some(handle) = guard.as_mut() else {
            return Err(QueueError::StorageClosed);
        };
        let mut line = serde_json::to_string(job)
            .map_err(|e| QueueError::ProcessorError(e.to_string()))?;
        line.push('\n');
        handle
            .write_all(line.as_bytes())
            .await
            .map_err(QueueError::StorageIo)?;
        handle.flush().await.map_err(QueueError::StorageIo)
    }

    /// Rewrites `path` to hold exactly one record per entry in `table`,
    /// dropping every superseded line and every line for a removed job.
    async fn compact(path: &Path, table: &HashMap<JobId, Job>) -> Result<File, QueueError> {
        let mut buf = String::new();
        for job in table.values() {
            buf.push_str(&serde_json::to_string(job).map_err(|e| QueueError::ProcessorError(e.to_string()))?);
            buf.push('\n');
        }
        fs::write(path, buf).await.map_err(QueueError::StorageIo)?;
        OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(QueueError::StorageIo)
    }

    async fn load_table(path: &Path) -> Result<HashMap<JobId, Job>, QueueError> {
        let mut table = HashMap::new();
        if !fs::try_exists(path).await.map_err(QueueError::StorageIo)? {
            return Ok(table);
        }
        let contents = fs::read_to_string(path).await.map_err(QueueError::StorageIo)?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Job>(line) {
                Ok(job) => {
                    table.insert(job.id, job);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed log line during recovery");
                }
            }
        }
        Ok(table)
    }
}

fn dead_letter_path(main_path: &Path) -> PathBuf {
    let stem = main_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "jobkeep".into());
    let ext = main_path.extension().map(|e| e.to_string_lossy().into_owned());
    let file_name = match ext {
        Some(ext) => format!("{stem}-dead-letter.{ext}"),
        None => format!("{stem}-dead-letter"),
    };
    main_path.with_file_name(file_name)
}

#[async_trait]
impl Storage for FileStorage {
    async fn initialize(&self) -> Result<(), QueueError> {
        let mut jobs = Self::load_table(&self.main_path).await?;
        let dead_letter = Self::load_table(&self.dlq_path).await?;

        let now = now_ms();
        for job in jobs.values_mut() {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Pending;
                job.attempts += 1;
                job.next_run_at = now;
                job.started_at = None;
                job.updated_at = now;
            }
        }

        let mut index = BTreeSet::new();
        let mut dependents = HashMap::new();
        for job in jobs.values() {
            if job.status == JobStatus::Pending {
                index.insert(pending_key(job));
            }
            if job.status == JobStatus::Waiting {
                for dep in &job.depends_on {
                    dependents.entry(*dep).or_insert_with(HashSet::new).insert(job.id);
                }
            }
        }

        let main_file = Self::compact(&self.main_path, &jobs).await?;
        let dlq_file = Self::compact(&self.dlq_path, &dead_letter).await?;

        *self.jobs.write().await = jobs;
        *self.dead_letter.write().await = dead_letter;
        *self.pending_index.write().await = index;
        *self.dependents_index.write().await = dependents;
        *self.main_file.lock().await = Some(main_file);
        *self.dlq_file.lock().await = Some(dlq_file);
        Ok(())
    }

    async fn add_job(&self, job: Job) -> Result<(), QueueError> {
        self.check_open()?;
        {
            let jobs = self.jobs.read().await;
            if jobs.contains_key(&job.id) {
                return Err(QueueError::ConfigInvalid(format!(
                    "job {} already exists",
                    job.id
                )));
            }
        }
        Self::append(&self.main_file, &job).await?;
        self.reindex(&job).await;
        self.reindex_dependents(&job).await;
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn update_job(&self, job: Job) -> Result<(), QueueError> {
        self.check_open()?;
        {
            let jobs = self.jobs.read().await;
            if !jobs.contains_key(&job.id) {
                return Err(QueueError::StorageNotFound(job.id));
            }
        }
        Self::append(&self.main_file, &job).await?;
        self.reindex(&job).await;
        self.reindex_dependents(&job).await;
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn get_dependents(&self, id: JobId) -> Result<Vec<JobId>, QueueError> {
        self.check_open()?;
        Ok(self
            .dependents_index
            .read()
            .await
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.check_open()?;
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.check_open()?;
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn get_pending_jobs(&self, now_ms: i64) -> Result<Vec<Job>, QueueError> {
        self.check_open()?;
        let index = self.pending_index.read().await;
        let jobs = self.jobs.read().await;
        Ok(index
            .iter()
            .filter(|k| k.next_run_at <= now_ms)
            .filter_map(|k| jobs.get(&k.id).cloned())
            .collect())
    }

    async fn move_to_dead_letter(&self, job: Job) -> Result<(), QueueError> {
        self.check_open()?;
        self.deindex(job.id).await;
        self.deindex_dependents(&job).await;
        self.jobs.write().await.remove(&job.id);

        Self::append(&self.dlq_file, &job).await?;
        self.dead_letter.write().await.insert(job.id, job);

        let jobs_snapshot = self.jobs.read().await.clone();
        let compacted = Self::compact(&self.main_path, &jobs_snapshot).await?;
        *self.main_file.lock().await = Some(compacted);
        Ok(())
    }

    async fn get_failed_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.check_open()?;
        Ok(self.dead_letter.read().await.values().cloned().collect())
    }

    async fn remove_from_dead_letter(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.check_open()?;
        let removed = self.dead_letter.write().await.remove(&id);
        if removed.is_some() {
            let snapshot = self.dead_letter.read().await.clone();
            let compacted = Self::compact(&self.dlq_path, &snapshot).await?;
            *self.dlq_file.lock().await = Some(compacted);
        }
        Ok(removed)
    }

    async fn remove_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.check_open()?;
        self.deindex(id).await;
        let removed = self.jobs.write().await.remove(&id);
        if let Some(job) = &removed {
            self.deindex_dependents(job).await;
            let jobs_snapshot = self.jobs.read().await.clone();
            let compacted = Self::compact(&self.main_path, &jobs_snapshot).await?;
            *self.main_file.lock().await = Some(compacted);
        }
        Ok(removed)
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        *self.main_file.lock().await = None;
        *self.dlq_file.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobkeep::job::{JobOptions, JobStatus};
    use serde_json::json;
    use tempfile::tempdir;

    fn job(id: JobId, status: JobStatus) -> Job {
        let mut j = Job::new("noop", json!({}), 3, JobOptions { job_id: Some(id), ..Default::default() }, 0);
        j.status = status;
        j
    }

    #[tokio::test]
    async fn persists_and_reloads_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let id = JobId::new();
        {
            let storage = FileStorage::new(&path);
            storage.initialize().await.unwrap();
            storage.add_job(job(id, JobStatus::Pending)).await.unwrap();
        }

        let reopened = FileStorage::new(&path);
        reopened.initialize().await.unwrap();
        assert!(reopened.get_job(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn crash_recovery_requeues_processing_jobs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        let id = JobId::new();

        {
            let storage = FileStorage::new(&path);
            storage.initialize().await.unwrap();
            let mut j = job(id, JobStatus::Processing);
            j.started_at = Some(0);
            j.attempts = 1;
            storage.add_job(j).await.unwrap();
        }

        let reopened = FileStorage::new(&path);
        reopened.initialize().await.unwrap();
        let recovered = reopened.get_job(id).await.unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Pending);
        assert_eq!(recovered.attempts, 2);
    }

    #[tokio::test]
    async fn dead_letter_round_trips_to_its_own_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        let id = JobId::new();

        let storage = FileStorage::new(&path);
        storage.initialize().await.unwrap();
        storage.add_job(job(id, JobStatus::Pending)).await.unwrap();
        let j = storage.get_job(id).await.unwrap().unwrap();
        storage.move_to_dead_letter(j).await.unwrap();

        assert!(storage.get_job(id).await.unwrap().is_none());
        assert_eq!(storage.get_failed_jobs().await.unwrap().len(), 1);

        let reopened = FileStorage::new(&path);
        reopened.initialize().await.unwrap();
        assert_eq!(reopened.get_failed_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dependents_index_survives_a_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        let dep = JobId::new();
        let waiter = JobId::new();

        let storage = FileStorage::new(&path);
        storage.initialize().await.unwrap();
        storage.add_job(job(dep, JobStatus::Pending)).await.unwrap();
        let mut w = job(waiter, JobStatus::Waiting);
        w.depends_on = vec![dep];
        storage.add_job(w).await.unwrap();
        assert_eq!(storage.get_dependents(dep).await.unwrap(), vec![waiter]);

        let reopened = FileStorage::new(&path);
        reopened.initialize().await.unwrap();
        assert_eq!(reopened.get_dependents(dep).await.unwrap(), vec![waiter]);
    }

    #[tokio::test]
    async fn malformed_line_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        fs::write(&path, "{not json}\n").await.unwrap();

        let storage = FileStorage::new(&path);
        storage.initialize().await.unwrap();
        assert!(storage.get_all_jobs().await.unwrap().is_empty());
    }
}
