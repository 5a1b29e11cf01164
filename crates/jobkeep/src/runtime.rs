//! The queue orchestrator. Owns the scheduler, the worker pool and the
//! mutable runtime state, and is the only place admission, retry and
//! recurrence decisions get made.
//!
//! `spec.md` §5 sanctions either a mutex or an actor mailbox for "single
//! logical owner serialises mutation"; this is the mutex option. Every
//! public method that mutates shared state locks `QueueInner::state` for
//! the duration of that mutation, the same inflight-tracking role the
//! teacher gives its engine/handle pair, realized with a guard instead of
//! a command channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::events::{EventBus, EventSubscriber, JobEvent};
use crate::job::{now_ms, Job, JobId, JobOptions, JobStatus};
use crate::ratelimit::RateLimiter;
use crate::registry::ProcessorRegistry;
use crate::repeat::next_occurrence_ms;
use crate::scheduler::Scheduler;
use crate::storage::Storage;
use crate::worker::{LocalWorker, Worker, WorkerHandle};
use tracing::{info, warn};

/// Whether the idle worker pool spawns real child processes (the
/// production default, matching `spec.md` §4.7's isolation contract) or
/// runs handlers in-process. `jobkeep-testing` opts into the latter so
/// its test suite never re-execs the test binary as a "worker" — see
/// [`crate::worker::LocalWorker`]'s doc comment for why that would break.
#[derive(Clone, Copy, PartialEq, Eq)]
enum WorkerMode {
    ChildProcess,
    InProcess,
}

/// Snapshot counts across every status bucket, mirroring the counters a
/// dashboard or health check would poll.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub delayed: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub stalled: usize,
}

struct RepeatTimer {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

struct RuntimeState {
    active_jobs: HashSet<JobId>,
    completed_job_ids: HashSet<JobId>,
    idle_workers: Vec<WorkerHandle>,
    repeating_timers: HashMap<JobId, RepeatTimer>,
    rate_limiter: Option<RateLimiter>,
    paused: bool,
    shutting_down: bool,
}

struct QueueInner {
    storage: Arc<dyn Storage>,
    registry: ProcessorRegistry,
    events: EventBus,
    config: QueueConfig,
    scheduler: Scheduler,
    concurrency: Arc<Semaphore>,
    worker_mode: WorkerMode,
    state: Mutex<RuntimeState>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    stalled_task: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

/// Handle to a running queue. Cheaply `Clone`-able; every clone shares the
/// same underlying state.
#[derive(Clone)]
pub struct Queue(Arc<QueueInner>);

pub struct QueueBuilder {
    storage: Option<Arc<dyn Storage>>,
    registry: ProcessorRegistry,
    config: QueueConfig,
    event_capacity: usize,
    worker_mode: WorkerMode,
}

impl Default for QueueBuilder {
    fn default() -> Self {
        Self {
            storage: None,
            registry: ProcessorRegistry::default(),
            config: QueueConfig::default(),
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
            worker_mode: WorkerMode::ChildProcess,
        }
    }
}

impl QueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn registry(mut self, registry: ProcessorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Runs every job handler in the orchestrator's own process instead of
    /// an isolated child. Loses the crash-isolation guarantee `spec.md`
    /// §4.7 describes; intended for test harnesses (see
    /// `jobkeep-testing`), not production use.
    pub fn in_process_workers(mut self) -> Self {
        self.worker_mode = WorkerMode::InProcess;
        self
    }

    /// Validates configuration, initializes storage (crash recovery runs
    /// here), starts the scheduler and the dispatch/stalled-sweeper loops.
    pub async fn build(self) -> Result<Queue, QueueError> {
        self.config.validate()?;
        let storage = self
            .storage
            .ok_or_else(|| QueueError::ConfigInvalid("storage backend is required".into()))?;
        storage.initialize().await?;

        let events = EventBus::new(self.event_capacity);
        let (ready_tx, ready_rx) = unbounded_channel();
        let scheduler = Scheduler::new(storage.clone(), ready_tx, events.clone());

        let rate_limiter = self
            .config
            .rate_limiter
            .map(|cfg| RateLimiter::new(cfg, now_ms()));

        let inner = Arc::new(QueueInner {
            storage,
            registry: self.registry,
            events,
            concurrency: Arc::new(Semaphore::new(self.config.concurrency)),
            config: self.config,
            scheduler,
            worker_mode: self.worker_mode,
            state: Mutex::new(RuntimeState {
                active_jobs: HashSet::new(),
                completed_job_ids: HashSet::new(),
                idle_workers: Vec::new(),
                repeating_timers: HashMap::new(),
                rate_limiter,
                paused: false,
                shutting_down: false,
            }),
            dispatch_task: Mutex::new(None),
            stalled_task: Mutex::new(None),
        });

        let queue = Queue(inner);
        queue.recover_completed_dependencies().await?;
        queue.rearm_recovered_repeats().await?;
        queue.0.scheduler.start();
        queue.spawn_dispatch_loop(ready_rx).await;
        queue.spawn_stalled_sweeper().await;
        Ok(queue)
    }
}

impl Queue {
    pub fn builder() -> QueueBuilder {
        QueueBuilder::new()
    }

    pub fn subscribe(&self) -> EventSubscriber {
        self.0.events.subscribe()
    }

    /// Enqueues a new job. Status, `next_run_at` and initial event are all
    /// derived from `options` per the status lifecycle rule in `Job::new`.
    pub async fn add(
        &self,
        handler: impl Into<String>,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let state = self.0.state.lock().await;
        if state.shutting_down {
            return Err(QueueError::ShuttingDown);
        }
        drop(state);

        if let Some(repeat) = &options.repeat {
            if let crate::job::RepeatSchedule::Pattern(pattern) = &repeat.schedule {
                crate::cron::CronSchedule::parse(pattern)?;
            }
        }

        let job = Job::new(
            handler,
            payload,
            self.0.config.retry.max_attempts,
            options,
            now_ms(),
        );
        self.0.storage.add_job(job.clone()).await?;

        match job.status {
            JobStatus::Waiting => self.0.events.emit(JobEvent::Waiting(job.clone())),
            JobStatus::Delayed => self.0.events.emit(JobEvent::Delayed(job.clone())),
            _ => {}
        }

        if job.repeat_config.is_some() {
            self.arm_recurrence(job.clone()).await;
        }

        Ok(job.id)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.0.storage.get_job(id).await
    }

    pub async fn get_all_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.0.storage.get_all_jobs().await
    }

    pub async fn get_failed_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.0.storage.get_failed_jobs().await
    }

    /// Removes a job from the main store regardless of its status.
    /// Clears any bookkeeping the runtime keeps about it: its
    /// `completed_job_ids` entry (if any) and a recurrence series armed
    /// under this id, so a removed repeating job's clones stop as well.
    /// Does not touch the dead-letter store; use [`Queue::reprocess_failed`]
    /// or a `DeadLetterView` for that. Returns the removed job, or `None`
    /// if no job with that id was in the main store.
    pub async fn remove_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let removed = self.0.storage.remove_job(id).await?;
        if removed.is_some() {
            let timer = {
                let mut state = self.0.state.lock().await;
                state.completed_job_ids.remove(&id);
                state.repeating_timers.remove(&id)
            };
            if let Some(timer) = timer {
                timer.cancel.cancel();
                timer.task.abort();
            }
        }
        Ok(removed)
    }

    /// Moves a dead-lettered job back onto the main store, reset for a
    /// fresh attempt. Returns `false` if no such job is in the DLQ.
    pub async fn reprocess_failed(&self, id: JobId) -> Result<bool, QueueError> {
        let Some(job) = self.0.storage.remove_from_dead_letter(id).await? else {
            return Ok(false);
        };
        let reset = job.reset_for_reprocess(now_ms());
        self.0.storage.add_job(reset.clone()).await?;
        self.0.events.emit(JobEvent::Waiting(reset));
        Ok(true)
    }

    pub async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();
        for job in self.0.storage.get_all_jobs().await? {
            match job.status {
                JobStatus::Waiting => stats.waiting += 1,
                JobStatus::Delayed => stats.delayed += 1,
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Stalled => stats.stalled += 1,
                // `Failed` jobs are moved out of the main store into the
                // dead-letter store the moment they fail; see `failed` below.
                JobStatus::Failed => {}
            }
        }
        stats.failed = self.0.storage.get_failed_jobs().await?.len();
        Ok(stats)
    }

    pub async fn pause(&self) {
        let mut state = self.0.state.lock().await;
        if state.paused {
            return;
        }
        state.paused = true;
        self.0.scheduler.stop();
    }

    pub async fn resume(&self) {
        let mut state = self.0.state.lock().await;
        if !state.paused || state.shutting_down {
            return;
        }
        state.paused = false;
        self.0.scheduler.start();
    }

    /// Blocks until no job is waiting, delayed, pending or in flight.
    pub async fn drain(&self) -> Result<(), QueueError> {
        loop {
            let jobs = self.0.storage.get_all_jobs().await?;
            let outstanding = jobs.iter().any(|j| {
                matches!(
                    j.status,
                    JobStatus::Waiting | JobStatus::Delayed | JobStatus::Pending | JobStatus::Processing
                )
            });
            let active_empty = self.0.state.lock().await.active_jobs.is_empty();
            if !outstanding && active_empty {
                self.0.events.emit(JobEvent::Drained);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Physically removes `completed` jobs older than `max_age_ms`.
    pub async fn clean(&self, max_age_ms: i64) -> Result<usize, QueueError> {
        let now = now_ms();
        let jobs = self.0.storage.get_all_jobs().await?;
        let mut removed = 0;
        for job in jobs {
            if job.status == JobStatus::Completed {
                if let Some(completed_at) = job.completed_at {
                    if now - completed_at >= max_age_ms {
                        self.0.storage.remove_job(job.id).await?;
                        self.0.state.lock().await.completed_job_ids.remove(&job.id);
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Idempotent: a second call observes `shutting_down` already set and
    /// returns once in-flight work has already drained.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        {
            let mut state = self.0.state.lock().await;
            if state.shutting_down {
                return Ok(());
            }
            state.shutting_down = true;
        }
        info!("queue shutdown requested");
        self.0.scheduler.stop();
        if let Some(task) = self.0.dispatch_task.lock().await.take() {
            task.abort();
        }
        if let Some((task, cancel)) = self.0.stalled_task.lock().await.take() {
            cancel.cancel();
            task.abort();
        }

        let timers: Vec<RepeatTimer> = {
            let mut state = self.0.state.lock().await;
            state.repeating_timers.drain().map(|(_, t)| t).collect()
        };
        for timer in timers {
            timer.cancel.cancel();
            timer.task.abort();
        }

        loop {
            let empty = self.0.state.lock().await.active_jobs.is_empty();
            if empty {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let idle: Vec<WorkerHandle> = {
            let mut state = self.0.state.lock().await;
            std::mem::take(&mut state.idle_workers)
        };
        for worker in idle {
            worker.terminate().await;
        }

        self.0.storage.close().await
    }

    /// Rebuilds the in-memory `completed_job_ids` set from storage (it
    /// does not itself persist across a restart) and promotes any
    /// `waiting` job whose dependencies were already `completed` in a
    /// prior process lifetime. Without this, a dependent enqueued before
    /// a crash would stay `waiting` forever even though its dependency
    /// had already finished.
    async fn recover_completed_dependencies(&self) -> Result<(), QueueError> {
        let all_jobs = self.0.storage.get_all_jobs().await?;
        let completed: HashSet<JobId> = all_jobs
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .map(|j| j.id)
            .collect();
        self.0.state.lock().await.completed_job_ids = completed.clone();

        for mut job in all_jobs {
            if job.status != JobStatus::Waiting {
                continue;
            }
            if job.depends_on.iter().all(|d| completed.contains(d)) {
                job.status = JobStatus::Pending;
                job.next_run_at = now_ms();
                job.updated_at = now_ms();
                self.0.storage.update_job(job).await?;
            }
        }
        Ok(())
    }

    async fn rearm_recovered_repeats(&self) -> Result<(), QueueError> {
        for job in self.0.storage.get_all_jobs().await? {
            if job.repeat_config.is_some() && !job.is_terminal() {
                self.arm_recurrence(job).await;
            }
        }
        Ok(())
    }

    async fn arm_recurrence(&self, basis: Job) {
        let Some(repeat) = basis.repeat_config.clone() else {
            return;
        };
        let Some(first_next) = next_occurrence_ms(&repeat, basis.repeat_count, now_ms()) else {
            return;
        };

        let series_id = basis.id;
        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();
        let queue = self.clone();

        let task = tokio::spawn(async move {
            let mut current = basis;
            let mut next_at = first_next;
            loop {
                let delay = (next_at - now_ms()).max(0) as u64;
                tokio::select! {
                    _ = cancel_for_task.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                }

                let now = now_ms();
                let clone_job = current.next_occurrence(next_at.max(now), now);
                if queue.0.storage.add_job(clone_job.clone()).await.is_err() {
                    return;
                }
                queue.0.events.emit(JobEvent::Delayed(clone_job.clone()));

                let Some(repeat) = clone_job.repeat_config.clone() else { return };
                match next_occurrence_ms(&repeat, clone_job.repeat_count, now) {
                    Some(next) => {
                        next_at = next;
                        current = clone_job;
                    }
                    None => return,
                }
            }
        });

        self.0
            .state
            .lock()
            .await
            .repeating_timers
            .insert(series_id, RepeatTimer { task, cancel });
    }

    async fn spawn_dispatch_loop(&self, mut ready_rx: UnboundedReceiver<Job>) {
        let queue = self.clone();
        let task = tokio::spawn(async move {
            while let Some(job) = ready_rx.recv().await {
                queue.try_dispatch(job).await;
            }
        });
        *self.0.dispatch_task.lock().await = Some(task);
    }

    /// Runs the admission pipeline (§4.8, rules 1-6) for one scheduler
    /// offer. A rejected job simply stays `pending`; the scheduler offers
    /// it again on a later tick.
    async fn try_dispatch(&self, job: Job) {
        let permit = {
            let mut state = self.0.state.lock().await;
            if state.shutting_down {
                return;
            }
            if state.active_jobs.contains(&job.id) {
                return;
            }
            if !self.0.registry.contains(&job.handler) {
                return;
            }
            if !job
                .depends_on
                .iter()
                .all(|dep| state.completed_job_ids.contains(dep))
            {
                return;
            }
            let Ok(permit) = self.0.concurrency.clone().try_acquire_owned() else {
                return;
            };
            if let Some(limiter) = state.rate_limiter.as_mut() {
                if !limiter.consume(now_ms()) {
                    return;
                }
            }
            state.active_jobs.insert(job.id);
            permit
        };

        let mut job = job;
        job.status = JobStatus::Processing;
        job.started_at = Some(now_ms());
        job.updated_at = now_ms();
        if let Err(e) = self.0.storage.update_job(job.clone()).await {
            self.0.events.emit(JobEvent::Error(e.to_string()));
            self.0.state.lock().await.active_jobs.remove(&job.id);
            return;
        }
        self.0.events.emit(JobEvent::Active(job.clone()));

        let queue = self.clone();
        tokio::spawn(async move { queue.run_job(job, permit).await });
    }

    async fn run_job(&self, job: Job, _permit: tokio::sync::OwnedSemaphorePermit) {
        let mut worker = match self.acquire_worker().await {
            Ok(w) => w,
            Err(e) => {
                self.handle_failure(job, e.to_string()).await;
                return;
            }
        };

        let (progress_tx, mut progress_rx) = unbounded_channel::<(JobId, u8)>();
        let events = self.0.events.clone();
        let storage = self.0.storage.clone();
        let job_for_progress = job.clone();
        let progress_task = tokio::spawn(async move {
            while let Some((_, progress)) = progress_rx.recv().await {
                let mut updated = job_for_progress.clone();
                updated.progress = progress;
                updated.updated_at = now_ms();
                let _ = storage.update_job(updated.clone()).await;
                events.emit(JobEvent::Progress {
                    job: updated,
                    progress,
                });
            }
        });

        let outcome = worker.execute(job.clone(), progress_tx).await;
        progress_task.abort();

        if outcome.crashed {
            warn!(job_id = %job.id, "worker crashed during execution");
        } else {
            self.0.state.lock().await.idle_workers.push(worker);
        }

        if outcome.result.success {
            let value = outcome.result.value.unwrap_or(Value::Null);
            self.handle_success(job, value).await;
        } else {
            let error = outcome.result.error.unwrap_or_else(|| "processor failed".into());
            self.handle_failure(job, error).await;
        }
    }

    async fn acquire_worker(&self) -> Result<WorkerHandle, QueueError> {
        let existing = self.0.state.lock().await.idle_workers.pop();
        if let Some(worker) = existing {
            return Ok(worker);
        }
        match self.0.worker_mode {
            WorkerMode::ChildProcess => {
                Worker::spawn(self.0.registry.handler_names())
                    .await
                    .map(WorkerHandle::ChildProcess)
            }
            WorkerMode::InProcess => Ok(WorkerHandle::InProcess(LocalWorker::new(
                self.0.registry.clone(),
            ))),
        }
    }

    async fn handle_success(&self, mut job: Job, result: Value) {
        let now = now_ms();
        job.status = JobStatus::Completed;
        job.result = Some(result.clone());
        job.progress = 100;
        job.completed_at = Some(now);
        job.updated_at = now;

        if let Err(e) = self.0.storage.update_job(job.clone()).await {
            self.0.events.emit(JobEvent::Error(e.to_string()));
        }

        {
            let mut state = self.0.state.lock().await;
            state.active_jobs.remove(&job.id);
            state.completed_job_ids.insert(job.id);
        }

        self.0.events.emit(JobEvent::Completed {
            job: job.clone(),
            result,
        });

        self.promote_satisfied_dependents(job.id).await;
    }

    async fn handle_failure(&self, mut job: Job, error: String) {
        let now = now_ms();
        job.attempts += 1;
        job.error = Some(error.clone());
        job.updated_at = now;

        if job.attempts >= job.max_attempts {
            job.status = JobStatus::Failed;
            self.0.state.lock().await.active_jobs.remove(&job.id);
            warn!(job_id = %job.id, attempts = job.attempts, "job exhausted retries, moving to dead letter");
            if let Err(e) = self.0.storage.move_to_dead_letter(job.clone()).await {
                self.0.events.emit(JobEvent::Error(e.to_string()));
            }
            self.0.events.emit(JobEvent::Failed {
                job: job.clone(),
                error,
            });
            return;
        }

        job.status = JobStatus::Pending;
        job.next_run_at = self.0.config.retry.backoff.next_run_at(job.attempts, now);
        self.0.state.lock().await.active_jobs.remove(&job.id);
        if let Err(e) = self.0.storage.update_job(job.clone()).await {
            self.0.events.emit(JobEvent::Error(e.to_string()));
        }
    }

    /// Looks up only the jobs that actually named `completed_id` as a
    /// dependency (via the storage backend's dependents index) instead of
    /// scanning every waiting job, and promotes those whose full
    /// `depends_on` set is now satisfied.
    async fn promote_satisfied_dependents(&self, completed_id: JobId) {
        let Ok(candidate_ids) = self.0.storage.get_dependents(completed_id).await else {
            return;
        };
        if candidate_ids.is_empty() {
            return;
        }
        let completed = self.0.state.lock().await.completed_job_ids.clone();
        for id in candidate_ids {
            let Ok(Some(mut job)) = self.0.storage.get_job(id).await else {
                continue;
            };
            if job.status != JobStatus::Waiting {
                continue;
            }
            if job.depends_on.iter().all(|d| completed.contains(d)) {
                job.status = JobStatus::Pending;
                job.next_run_at = now_ms();
                job.updated_at = now_ms();
                let _ = self.0.storage.update_job(job).await;
            }
        }
    }

    async fn spawn_stalled_sweeper(&self) {
        let queue = self.clone();
        let interval = self.0.config.stalled_interval;
        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel_for_task.cancelled() => return,
                    _ = ticker.tick() => {
                        queue.sweep_stalled(interval).await;
                    }
                }
            }
        });

        *self.0.stalled_task.lock().await = Some((task, cancel));
    }

    async fn sweep_stalled(&self, threshold: Duration) {
        let Ok(processing) = self.0.storage.get_processing_jobs().await else {
            return;
        };
        let now = now_ms();
        let threshold_ms = threshold.as_millis() as i64;
        for mut job in processing {
            let Some(started) = job.started_at else { continue };
            if now - started >= threshold_ms {
                job.status = JobStatus::Stalled;
                job.updated_at = now;
                if self.0.storage.update_job(job.clone()).await.is_ok() {
                    self.0.state.lock().await.active_jobs.remove(&job.id);
                    self.0.events.emit(JobEvent::Stalled(job));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOptions, JobStatus};
    use crate::registry::ProcessorRegistryBuilder;
    use serde_json::json;

    async fn echo_queue() -> Queue {
        let storage: Arc<dyn Storage> = Arc::new(crate::storage::MemoryStorage::new());
        let registry = ProcessorRegistryBuilder::new()
            .register_fn("echo", |payload, _ctx| async move { Ok(payload) })
            .build();
        QueueBuilder::new()
            .storage(storage)
            .registry(registry)
            .in_process_workers()
            .build()
            .await
            .unwrap()
    }

    /// A job already `completed` in a prior process lifetime must unblock
    /// a `waiting` dependent on the very next build, not just on a fresh
    /// `completed` event this process happens to observe.
    #[tokio::test]
    async fn waiting_job_recovers_against_already_completed_dependency() {
        let storage: Arc<dyn Storage> = Arc::new(crate::storage::MemoryStorage::new());
        storage.initialize().await.unwrap();

        let mut dep = Job::new("echo", json!({}), 3, JobOptions::default(), now_ms());
        dep.status = JobStatus::Completed;
        dep.completed_at = Some(now_ms());
        storage.add_job(dep.clone()).await.unwrap();

        let mut waiter = Job::new(
            "echo",
            json!({}),
            3,
            JobOptions {
                depends_on: vec![dep.id],
                ..Default::default()
            },
            now_ms(),
        );
        waiter.status = JobStatus::Waiting;
        storage.add_job(waiter.clone()).await.unwrap();

        let registry = ProcessorRegistryBuilder::new()
            .register_fn("echo", |payload, _ctx| async move { Ok(payload) })
            .build();
        let queue = QueueBuilder::new()
            .storage(storage)
            .registry(registry)
            .in_process_workers()
            .build()
            .await
            .unwrap();

        let recovered = queue.get_job(waiter.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Pending);
        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn add_rejects_an_unparseable_cron_pattern_without_persisting_the_job() {
        let queue = echo_queue().await;
        let result = queue
            .add(
                "echo",
                json!({}),
                JobOptions {
                    repeat: Some(crate::job::RepeatConfig {
                        schedule: crate::job::RepeatSchedule::Pattern("not a pattern".into()),
                        limit: None,
                        start_date: None,
                        end_date: None,
                    }),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(QueueError::InvalidCron { .. })));
        assert!(queue.get_all_jobs().await.unwrap().is_empty());
        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn add_rejects_once_shutting_down() {
        let queue = echo_queue().await;
        queue.shutdown().await.unwrap();
        let result = queue.add("echo", json!({}), JobOptions::default()).await;
        assert!(matches!(result, Err(QueueError::ShuttingDown)));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let queue = echo_queue().await;
        queue.shutdown().await.unwrap();
        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn clean_removes_only_old_completed_jobs() {
        let queue = echo_queue().await;
        let id = queue.add("echo", json!({}), JobOptions::default()).await.unwrap();

        let start = crate::job::now_ms();
        while queue.get_job(id).await.unwrap().map(|j| j.status) != Some(JobStatus::Completed) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if crate::job::now_ms() - start > 2000 {
                panic!("job never completed");
            }
        }

        let removed = queue.clean(1_000_000).await.unwrap();
        assert_eq!(removed, 0);
        assert!(queue.get_job(id).await.unwrap().is_some());

        let removed = queue.clean(0).await.unwrap();
        assert_eq!(removed, 1);
        assert!(queue.get_job(id).await.unwrap().is_none());
        queue.shutdown().await.unwrap();
    }
}
