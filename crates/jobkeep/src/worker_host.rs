//! Child-side of the IPC protocol. An embedding binary calls
//! [`run`] at the top of its `main` whenever [`crate::worker::WORKER_MODE_ENV`]
//! is set, handing it the same [`ProcessorRegistry`] its orchestrator path
//! builds — the registry is what makes the two sides agree on handlers
//! without shipping code across the process boundary.
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = build_registry();
//!     if std::env::var(jobkeep::worker::WORKER_MODE_ENV).is_ok() {
//!         jobkeep::worker_host::run(registry).await?;
//!         return Ok(());
//!     }
//!     // ... normal orchestrator startup ...
//!     Ok(())
//! }
//! ```

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::ipc::{ChildMessage, JobResult, ParentMessage};
use crate::job::Job;
use crate::registry::{JobContext, ProcessorRegistry};

/// Runs the worker-host loop against stdin/stdout until the parent sends
/// `terminate` or closes the pipe. Returns once the child should exit.
pub async fn run(registry: ProcessorRegistry) -> io::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ChildMessage>();

    let _ = out_tx.send(ChildMessage::Ready);

    loop {
        tokio::select! {
            maybe_line = lines.next_line() => {
                let Some(line) = maybe_line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(msg) = serde_json::from_str::<ParentMessage>(&line) else {
                    continue;
                };
                match msg {
                    ParentMessage::SetProcessor { .. } => {
                        let _ = out_tx.send(ChildMessage::ProcessorSet);
                    }
                    ParentMessage::Execute { job } => {
                        let registry = registry.clone();
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move { run_job(registry, job, out_tx).await });
                    }
                    ParentMessage::Terminate => break,
                }
            }
            Some(msg) = out_rx.recv() => {
                write_message(&mut stdout, &msg).await?;
            }
        }
    }
    Ok(())
}

async fn run_job(
    registry: ProcessorRegistry,
    job: Job,
    out_tx: mpsc::UnboundedSender<ChildMessage>,
) {
    let ctx = JobContext::new(job.id, job.attempts, out_tx.clone());
    let result = match registry.get(&job.handler) {
        Some(processor) => match processor.execute(job.payload.clone(), ctx).await {
            Ok(value) => JobResult::ok(value),
            Err(error) => JobResult::err(error),
        },
        None => JobResult::err(format!("no processor registered for handler {:?}", job.handler)),
    };
    let _ = out_tx.send(ChildMessage::Result {
        job_id: job.id,
        result,
    });
}

async fn write_message(
    stdout: &mut tokio::io::Stdout,
    msg: &ChildMessage,
) -> io::Result<()> {
    let mut line =
        serde_json::to_string(msg).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    line.push('\n');
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await
}
