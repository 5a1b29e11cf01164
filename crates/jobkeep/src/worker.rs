//! Parent-side of child-process job execution. Each [`Worker`] owns one
//! long-lived child, forked by re-executing the current binary with
//! [`WORKER_MODE_ENV`] set so the embedding application's own `main`
//! dispatches into [`crate::worker_host::run`] instead of its normal
//! start-up path.
//!
//! Isolating user code in a child process means an uncaught panic,
//! out-of-memory, or infinite loop only degrades one worker; the crashed
//! outcome flows back into the same retry/backoff path as any other
//! execution failure.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::timeout;

use crate::error::QueueError;
use crate::ipc::{ChildMessage, JobResult, ParentMessage};
use crate::job::{Job, JobId};
use crate::registry::{JobContext, ProcessorRegistry};

pub const WORKER_INIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const WORKER_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Env var an embedding binary inspects at the very top of `main` to
/// decide whether it is the orchestrator or a re-exec'd worker host.
pub const WORKER_MODE_ENV: &str = "JOBKEEP_WORKER_MODE";

pub struct ExecutionOutcome {
    pub result: JobResult,
    /// Set when the child exited or its pipe closed mid-job. The worker
    /// that produced this outcome must not be reused.
    pub crashed: bool,
}

/// One long-lived child process executing job payloads in isolation.
/// Processes one job at a time; [`Worker::is_busy`] mirrors that.
pub struct Worker {
    child: Child,
    stdin: ChildStdin,
    incoming: mpsc::UnboundedReceiver<ChildMessage>,
    _reader_task: tokio::task::JoinHandle<()>,
    busy: bool,
}

impl Worker {
    /// Spawns the child, waits for `ready` (bounded by
    /// [`WORKER_INIT_TIMEOUT`]), then sends `set-processor` naming the
    /// handlers the caller expects to be available.
    pub async fn spawn(handler_names: Vec<String>) -> Result<Self, QueueError> {
        let exe = std::env::current_exe().map_err(QueueError::StorageIo)?;
        let mut child = Command::new(exe)
            .env(WORKER_MODE_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(QueueError::StorageIo)?;

        let stdout = child.stdout.take().expect("worker spawned with piped stdout");
        let stdin = child.stdin.take().expect("worker spawned with piped stdin");
        let (tx, rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_loop(stdout, tx));

        let mut worker = Self {
            child,
            stdin,
            incoming: rx,
            _reader_task: reader_task,
            busy: false,
        };

        worker.await_ready().await?;
        worker
            .send(&ParentMessage::SetProcessor {
                handlers: handler_names,
            })
            .await?;
        Ok(worker)
    }

    async fn await_ready(&mut self) -> Result<(), QueueError> {
        match timeout(WORKER_INIT_TIMEOUT, self.incoming.recv()).await {
            Ok(Some(ChildMessage::Ready)) => Ok(()),
            Ok(Some(_)) | Ok(None) => Err(QueueError::WorkerInitTimeout),
            Err(_elapsed) => Err(QueueError::WorkerInitTimeout),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Executes one job. `progress_tx` receives `(job_id, progress)`
    /// updates the child reports while the job is in flight.
    pub async fn execute(
        &mut self,
        job: Job,
        progress_tx: UnboundedSender<(JobId, u8)>,
    ) -> ExecutionOutcome {
        self.busy = true;
        let job_id = job.id;

        if let Err(e) = self.send(&ParentMessage::Execute { job }).await {
            self.busy = false;
            return ExecutionOutcome {
                result: JobResult::err(e.to_string()),
                crashed: true,
            };
        }

        loop {
            match self.incoming.recv().await {
                Some(ChildMessage::Progress {
                    job_id: pid,
                    progress,
                }) => {
                    if pid == job_id {
                        let _ = progress_tx.send((pid, progress));
                    }
                }
                Some(ChildMessage::Result {
                    job_id: rid,
                    result,
                }) if rid == job_id => {
                    self.busy = false;
                    return ExecutionOutcome {
                        result,
                        crashed: false,
                    };
                }
                Some(_) => continue,
                None => {
                    self.busy = false;
                    let (code, signal) = self.exit_status();
                    return ExecutionOutcome {
                        result: JobResult::err(format!(
                            "worker crashed: code={code:?}, signal={signal:?}"
                        )),
                        crashed: true,
                    };
                }
            }
        }
    }

    /// Graceful kill; hard-kills after [`WORKER_TERMINATE_GRACE`] if the
    /// child has not exited. No-op on an uninitialised worker (there is
    /// none in this design — a `Worker` always has a live child once
    /// constructed).
    pub async fn terminate(mut self) {
        let _ = self.send(&ParentMessage::Terminate).await;
        if timeout(WORKER_TERMINATE_GRACE, self.child.wait())
            .await
            .is_err()
        {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
    }

    async fn send(&mut self, msg: &ParentMessage) -> Result<(), QueueError> {
        let mut line =
            serde_json::to_string(msg).map_err(|e| QueueError::ProcessorError(e.to_string()))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(QueueError::StorageIo)?;
        self.stdin.flush().await.map_err(QueueError::StorageIo)?;
        Ok(())
    }

    fn exit_status(&mut self) -> (Option<i32>, Option<i32>) {
        match self.child.try_wait() {
            Ok(Some(status)) => (status.code(), unix_signal(&status)),
            _ => (None, None),
        }
    }
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

async fn read_loop(
    stdout: tokio::process::ChildStdout,
    tx: mpsc::UnboundedSender<ChildMessage>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ChildMessage>(&line) {
                    Ok(msg) => {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(_) => continue,
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

/// Runs a processor in the orchestrator's own process instead of a child.
///
/// `Worker::spawn` re-executes `current_exe()`, which is correct for an
/// embedding application whose `main` checks [`WORKER_MODE_ENV`] per this
/// module's doc comment — but a `cargo test` binary has no such check, so
/// re-exec'ing it would just re-run the whole test suite as the "child".
/// `jobkeep-testing` builds queues with this runner instead so unit tests
/// never fork a process at all; the rest of the admission/retry/DLQ
/// pipeline is exercised identically either way.
pub struct LocalWorker {
    registry: ProcessorRegistry,
    busy: bool,
}

impl LocalWorker {
    pub fn new(registry: ProcessorRegistry) -> Self {
        Self {
            registry,
            busy: false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub async fn execute(
        &mut self,
        job: Job,
        progress_tx: UnboundedSender<(JobId, u8)>,
    ) -> ExecutionOutcome {
        self.busy = true;
        let ctx = JobContext::new(job.id, job.attempts, {
            let (tx, mut rx) = mpsc::unbounded_channel::<ChildMessage>();
            tokio::spawn(async move {
                while let Some(ChildMessage::Progress { job_id, progress }) = rx.recv().await {
                    let _ = progress_tx.send((job_id, progress));
                }
            });
            tx
        });

        let result = match self.registry.get(&job.handler) {
            Some(processor) => match processor.execute(job.payload.clone(), ctx).await {
                Ok(value) => JobResult::ok(value),
                Err(error) => JobResult::err(error),
            },
            None => JobResult::err(format!(
                "no processor registered for handler {:?}",
                job.handler
            )),
        };
        self.busy = false;
        ExecutionOutcome {
            result,
            crashed: false,
        }
    }
}

/// Either kind of worker the runtime's idle pool can hold. Both sides
/// expose the same `execute`/`is_busy`/`terminate` surface so
/// [`crate::runtime::Queue`] does not need to know which one it has.
pub enum WorkerHandle {
    ChildProcess(Worker),
    InProcess(LocalWorker),
}

impl WorkerHandle {
    pub fn is_busy(&self) -> bool {
        match self {
            WorkerHandle::ChildProcess(w) => w.is_busy(),
            WorkerHandle::InProcess(w) => w.is_busy(),
        }
    }

    pub async fn execute(
        &mut self,
        job: Job,
        progress_tx: UnboundedSender<(JobId, u8)>,
    ) -> ExecutionOutcome {
        match self {
            WorkerHandle::ChildProcess(w) => w.execute(job, progress_tx).await,
            WorkerHandle::InProcess(w) => w.execute(job, progress_tx).await,
        }
    }

    pub async fn terminate(self) {
        match self {
            WorkerHandle::ChildProcess(w) => w.terminate().await,
            WorkerHandle::InProcess(_) => {}
        }
    }
}

#[cfg(test)]
mod local_tests {
    use super::*;
    use crate::job::JobOptions;
    use crate::registry::ProcessorRegistryBuilder;
    use serde_json::json;

    #[tokio::test]
    async fn local_worker_executes_registered_handler() {
        let registry = ProcessorRegistryBuilder::new()
            .register_fn("echo", |payload, _ctx| async move { Ok(payload) })
            .build();
        let mut worker = LocalWorker::new(registry);
        let job = Job::new("echo", json!({"v": 1}), 3, JobOptions::default(), 0);
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = worker.execute(job, tx).await;
        assert!(outcome.result.success);
        assert_eq!(outcome.result.value, Some(json!({"v": 1})));
        assert!(!outcome.crashed);
    }

    #[tokio::test]
    async fn local_worker_reports_unknown_handler_as_failure() {
        let registry = ProcessorRegistryBuilder::new().build();
        let mut worker = LocalWorker::new(registry);
        let job = Job::new("missing", json!({}), 3, JobOptions::default(), 0);
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = worker.execute(job, tx).await;
        assert!(!outcome.result.success);
        assert!(!outcome.crashed);
    }
}
