//! Lifecycle event fan-out. Generalizes the teacher's in-process observer
//! bus from arbitrary `Event` payloads to the fixed job-lifecycle
//! catalogue: `waiting`, `delayed`, `active`, `progress`, `completed`,
//! `failed`, `stalled`, `drained`, `error`.
//!
//! Delivery is at-most-once and non-blocking from the emitter's side: a
//! subscriber that falls too far behind observes a gap (via
//! [`tokio::sync::broadcast`]'s lag detection) rather than stalling the
//! runtime. Give the bus enough capacity that this is a rare event for
//! terminal events in practice; `progress` events are expected to be the
//! ones silently skipped by a slow consumer.

use tokio::sync::broadcast;

use crate::job::Job;

/// Default channel capacity for a queue's event bus.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum JobEvent {
    Waiting(Job),
    Delayed(Job),
    Active(Job),
    Progress { job: Job, progress: u8 },
    Completed { job: Job, result: serde_json::Value },
    Failed { job: Job, error: String },
    Stalled(Job),
    Drained,
    Error(String),
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. } | JobEvent::Failed { .. } | JobEvent::Drained
        )
    }
}

/// Fan-out publisher. Cheaply `Clone`-able; every clone shares the same
/// underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to the event stream. A dashboard, webhook forwarder, or
    /// test harness all use this same entry point.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.sender.subscribe(),
        }
    }

    /// Publish one event. Non-blocking; a channel with no subscribers
    /// simply drops the event.
    pub fn emit(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

pub struct EventSubscriber {
    rx: broadcast::Receiver<JobEvent>,
}

impl EventSubscriber {
    /// Await the next event, transparently skipping past a lag gap. `None`
    /// means the bus itself has been dropped.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, JobStatus};
    use serde_json::json;

    fn sample_job() -> Job {
        Job {
            id: JobId::new(),
            handler: "noop".into(),
            payload: json!({}),
            status: JobStatus::Completed,
            priority: 0,
            attempts: 0,
            max_attempts: 3,
            progress: 100,
            next_run_at: 0,
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
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        bus.emit(JobEvent::Completed {
            job: sample_job(),
            result: json!({"ok": true}),
        });
        let event = sub.recv().await.unwrap();
        assert!(event.is_terminal());
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_block() {
        let bus = EventBus::new(4);
        bus.emit(JobEvent::Drained);
    }
}
