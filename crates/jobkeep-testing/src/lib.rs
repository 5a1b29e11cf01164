//! Shared test harness for `jobkeep` and its satellite crates: a fixture
//! that wires a [`MemoryStorage`] and a handful of named processors into a
//! ready-to-use [`Queue`] without repeating the builder boilerplate in
//! every test module.
//!
//! Built with `QueueBuilder::in_process_workers()`: a real child-process
//! worker re-execs `current_exe()`, which under `cargo test` is the test
//! binary itself with no `main` that dispatches into `worker_host::run`,
//! so every fixture here runs handlers in-process instead.

use std::sync::Arc;
use std::time::Duration;

use jobkeep::config::QueueConfig;
use jobkeep::error::QueueError;
use jobkeep::job::JobId;
use jobkeep::registry::{JobContext, ProcessorRegistryBuilder};
use jobkeep::runtime::{Queue, QueueBuilder};
use jobkeep::storage::MemoryStorage;
use tokio::sync::Mutex;

/// Minimal fixture: a running queue plus the calls its handlers observed,
/// useful for asserting "this job actually ran" without inspecting IPC.
pub struct TestQueue {
    pub queue: Queue,
    pub calls: Arc<Mutex<Vec<JobId>>>,
}

impl TestQueue {
    /// A queue with one concurrency slot, default retry/backoff, and an
    /// `"echo"` handler that returns its payload unchanged.
    pub async fn new() -> Result<Self, QueueError> {
        Self::builder().build().await
    }

    pub fn builder() -> TestQueueHarnessBuilder {
        TestQueueHarnessBuilder::default()
    }

    pub async fn drain_and_stats(&self) -> Result<jobkeep::runtime::QueueStats, QueueError> {
        self.queue.drain().await?;
        self.queue.get_stats().await
    }
}

pub struct TestQueueHarnessBuilder {
    config: QueueConfig,
    registry: ProcessorRegistryBuilder,
    calls: Arc<Mutex<Vec<JobId>>>,
}

impl Default for TestQueueHarnessBuilder {
    fn default() -> Self {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_for_echo = calls.clone();
        let registry = ProcessorRegistryBuilder::new().register_fn("echo", move |payload, ctx: JobContext| {
            let calls = calls_for_echo.clone();
            async move {
                calls.lock().await.push(ctx.job_id());
                Ok(payload)
            }
        });
        Self {
            config: QueueConfig::default(),
            registry,
            calls,
        }
    }
}

impl TestQueueHarnessBuilder {
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers an additional handler that always succeeds with a fixed
    /// JSON value, recording every job id it was called with.
    pub fn with_succeeding_handler(mut self, name: impl Into<String>, result: serde_json::Value) -> Self {
        let calls = self.calls.clone();
        self.registry = self.registry.register_fn(name, move |_payload, ctx: JobContext| {
            let calls = calls.clone();
            let result = result.clone();
            async move {
                calls.lock().await.push(ctx.job_id());
                Ok(result)
            }
        });
        self
    }

    /// Registers a handler that always fails with `error`.
    pub fn with_failing_handler(mut self, name: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        self.registry = self.registry.register_fn(name, move |_payload, _ctx: JobContext| {
            let error = error.clone();
            async move { Err(error) }
        });
        self
    }

    /// Registers a handler that fails on each job's first `failures`
    /// attempts, then succeeds with `payload` unchanged. Driven by
    /// `ctx.attempts()` (the persisted attempt count), so it stays correct
    /// per job id even with several flaky jobs in flight at once.
    pub fn with_flaky_handler(mut self, name: impl Into<String>, failures: u32) -> Self {
        let calls = self.calls.clone();
        self.registry = self.registry.register_fn(name, move |payload, ctx: JobContext| {
            let calls = calls.clone();
            async move {
                calls.lock().await.push(ctx.job_id());
                if ctx.attempts() < failures {
                    Err("transient failure".to_string())
                } else {
                    Ok(payload)
                }
            }
        });
        self
    }

    pub async fn build(self) -> Result<TestQueue, QueueError> {
        let storage: Arc<dyn jobkeep::storage::Storage> = Arc::new(MemoryStorage::new());
        let queue = QueueBuilder::new()
            .storage(storage)
            .registry(self.registry.build())
            .config(self.config)
            .in_process_workers()
            .build()
            .await?;
        Ok(TestQueue {
            queue,
            calls: self.calls,
        })
    }
}

/// Polls `condition` every `interval` until it returns `true` or
/// `timeout` elapses, returning whether it converged. Useful for
/// asserting on event-driven state (job status, stats) without sprinkling
/// fixed sleeps through test bodies.
pub async fn wait_until<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

pub fn sample_job_options() -> jobkeep::job::JobOptions {
    jobkeep::job::JobOptions::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn echo_handler_runs_and_completes() {
        let harness = TestQueue::new().await.unwrap();
        let id = harness.queue.add("echo", json!({"v": 42}), Default::default()).await.unwrap();

        let completed = wait_until(StdDuration::from_secs(2), StdDuration::from_millis(20), || {
            let queue = harness.queue.clone();
            async move {
                matches!(
                    queue.get_job(id).await.unwrap().map(|j| j.status),
                    Some(jobkeep::job::JobStatus::Completed)
                )
            }
        })
        .await;

        assert!(completed);
        assert!(harness.calls.lock().await.contains(&id));
    }

    #[tokio::test]
    async fn failing_handler_reaches_dead_letter() {
        let harness = TestQueue::builder()
            .config(QueueConfig {
                retry: jobkeep::config::RetryConfig {
                    max_attempts: 1,
                    ..Default::default()
                },
                ..Default::default()
            })
            .with_failing_handler("boom", "always fails")
            .build()
            .await
            .unwrap();

        let id = harness.queue.add("boom", json!({}), Default::default()).await.unwrap();

        let dead_lettered = wait_until(StdDuration::from_secs(2), StdDuration::from_millis(20), || {
            let queue = harness.queue.clone();
            async move { queue.get_failed_jobs().await.unwrap().iter().any(|j| j.id == id) }
        })
        .await;

        assert!(dead_lettered);
    }

    #[tokio::test]
    async fn dependency_chain_completes_in_order() {
        let harness = TestQueue::new().await.unwrap();
        let a = harness.queue.add("echo", json!({"n": "a"}), Default::default()).await.unwrap();
        let b = harness
            .queue
            .add(
                "echo",
                json!({"n": "b"}),
                jobkeep::job::JobOptions {
                    depends_on: vec![a],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let c = harness
            .queue
            .add(
                "echo",
                json!({"n": "c"}),
                jobkeep::job::JobOptions {
                    depends_on: vec![b],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let all_done = wait_until(StdDuration::from_secs(2), StdDuration::from_millis(20), || {
            let queue = harness.queue.clone();
            async move {
                for id in [a, b, c] {
                    match queue.get_job(id).await.unwrap().map(|j| j.status) {
                        Some(jobkeep::job::JobStatus::Completed) => continue,
                        _ => return false,
                    }
                }
                true
            }
        })
        .await;
        assert!(all_done);

        let calls = harness.calls.lock().await;
        let pos = |id: jobkeep::job::JobId| calls.iter().position(|x| *x == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(c));
    }

    #[tokio::test]
    async fn remove_job_deletes_it_from_the_main_store() {
        let harness = TestQueue::new().await.unwrap();

        let blocker = harness
            .queue
            .add("echo", json!({}), jobkeep::job::JobOptions::default())
            .await
            .unwrap();
        let waiting = harness
            .queue
            .add(
                "echo",
                json!({}),
                jobkeep::job::JobOptions {
                    depends_on: vec![blocker],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let removed = harness.queue.remove_job(waiting).await.unwrap();
        assert!(removed.is_some());
        assert!(harness.queue.get_job(waiting).await.unwrap().is_none());
        assert!(harness.queue.remove_job(waiting).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_then_success_reaches_completed_with_one_recorded_attempt() {
        let harness = TestQueue::builder()
            .config(QueueConfig {
                retry: jobkeep::config::RetryConfig {
                    max_attempts: 3,
                    backoff: jobkeep::backoff::BackoffPolicy::new(jobkeep::backoff::BackoffKind::Fixed, 10),
                },
                ..Default::default()
            })
            .with_flaky_handler("flaky", 1)
            .build()
            .await
            .unwrap();

        let id = harness.queue.add("flaky", json!({"v": 1}), Default::default()).await.unwrap();

        let completed = wait_until(StdDuration::from_secs(2), StdDuration::from_millis(20), || {
            let queue = harness.queue.clone();
            async move {
                matches!(
                    queue.get_job(id).await.unwrap().map(|j| j.status),
                    Some(jobkeep::job::JobStatus::Completed)
                )
            }
        })
        .await;

        assert!(completed);
        let job = harness.queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(harness.calls.lock().await.iter().filter(|c| **c == id).count(), 2);
    }
}
