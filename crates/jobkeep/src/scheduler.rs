//! The single periodic ticker that turns "jobs past their `next_run_at`"
//! into offers the runtime may accept or veto. The scheduler itself never
//! decides concurrency, dependencies, or rate limits — it only orders and
//! offers; see the admission rules on the runtime side.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, JobEvent};
use crate::job::{now_ms, Job};
use crate::storage::Storage;

/// Scheduler tick period. Not configurable: `spec.md` fixes it at 200ms.
pub const TICK_INTERVAL: Duration = Duration::from_millis(200);

struct RunningHandle {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Periodic ticker. `start`/`stop` are both idempotent; calling `start`
/// again while running, or `stop` again while stopped, is a no-op.
pub struct Scheduler {
    storage: Arc<dyn Storage>,
    ready_tx: UnboundedSender<Job>,
    events: EventBus,
    running: Mutex<Option<RunningHandle>>,
}

impl Scheduler {
    pub fn new(storage: Arc<dyn Storage>, ready_tx: UnboundedSender<Job>, events: EventBus) -> Self {
        Self {
            storage,
            ready_tx,
            events,
            running: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            return;
        }

        let storage = self.storage.clone();
        let ready_tx = self.ready_tx.clone();
        let events = self.events.clone();
        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel_for_task.cancelled() => break,
                    _ = interval.tick() => {
                        tick(&storage, &ready_tx, &events).await;
                    }
                }
            }
        });

        *running = Some(RunningHandle { task, cancel });
    }

    pub fn stop(&self) {
        if let Some(handle) = self.running.lock().unwrap().take() {
            handle.cancel.cancel();
            handle.task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }
}

async fn tick(storage: &Arc<dyn Storage>, ready_tx: &UnboundedSender<Job>, events: &EventBus) {
    let now = now_ms();
    match storage.get_due_delayed_jobs(now).await {
        Ok(due) => {
            for mut job in due {
                job.status = crate::job::JobStatus::Pending;
                job.updated_at = now;
                if let Err(e) = storage.update_job(job).await {
                    events.emit(JobEvent::Error(e.to_string()));
                }
            }
        }
        Err(e) => events.emit(JobEvent::Error(e.to_string())),
    }

    match storage.get_pending_jobs(now_ms()).await {
        Ok(mut jobs) => {
            jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.next_run_at.cmp(&b.next_run_at)));
            for job in jobs {
                // Non-blocking: the runtime may drop offers that violate
                // concurrency or dependency admission rules.
                let _ = ready_tx.send(job);
            }
        }
        Err(e) => {
            events.emit(JobEvent::Error(e.to_string()));
        }
    }
}
