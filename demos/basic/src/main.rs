//! # Basic Demo
//!
//! Shows the whole lifecycle end to end: a file-backed queue, two
//! registered handlers, a dependency chain, and a handler that fails once
//! before succeeding. No dashboard, no webhook adapter - just the core
//! queue and its event stream.
//!
//! Run it twice in a row against the same `--file` path to see crash
//! recovery: kill it mid-run (e.g. `kill -9`) and restart it; any job
//! caught `processing` comes back as `pending` with `attempts` bumped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use jobkeep::job::JobOptions;
use jobkeep::registry::{JobContext, ProcessorRegistryBuilder};
use jobkeep::runtime::QueueBuilder;
use jobkeep::storage::Storage;
use jobkeep::worker::WORKER_MODE_ENV;
use jobkeep::{JobEvent, QueueConfig};
use jobkeep_file::FileStorage;
use serde_json::json;

fn build_registry() -> jobkeep::ProcessorRegistry {
    ProcessorRegistryBuilder::new()
        .register_fn("fetch", |payload, ctx: JobContext| async move {
            ctx.update_progress(50);
            ctx.log(format!("fetching {payload}"));
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctx.update_progress(100);
            Ok(json!({ "fetched": payload }))
        })
        .register_fn("flaky", |_payload, ctx: JobContext| async move {
            // Fails on its first attempt, succeeds on every retry after.
            // `ctx.attempts()` comes from the persisted job record, so
            // this stays correct even though each attempt may land in a
            // different worker child process.
            if ctx.attempts() == 0 {
                Err("transient failure, try again".to_string())
            } else {
                Ok(json!({ "ok": true }))
            }
        })
        .build()
}

#[tokio::main]
async fn main() -> Result<()> {
    let registry = build_registry();

    // The re-exec'd child path: a worker process is this same binary,
    // launched with JOBKEEP_WORKER_MODE set, dispatching straight into
    // the IPC host loop instead of the orchestrator startup below.
    if std::env::var(WORKER_MODE_ENV).is_ok() {
        jobkeep::worker_host::run(registry).await?;
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "jobkeep-demo.log".to_string());
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(&path));

    let queue = QueueBuilder::new()
        .storage(storage)
        .registry(registry)
        .config(QueueConfig {
            concurrency: 2,
            ..Default::default()
        })
        .build()
        .await?;

    let mut events = queue.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                JobEvent::Active(job) => println!("active    {} ({})", job.id, job.handler),
                JobEvent::Completed { job, .. } => println!("completed {} ({})", job.id, job.handler),
                JobEvent::Failed { job, error } => println!("failed    {} ({error})", job.id),
                JobEvent::Stalled(job) => println!("stalled   {}", job.id),
                JobEvent::Error(err) => eprintln!("error     {err}"),
                _ => {}
            }
        }
    });

    let fetch_a = queue.add("fetch", json!("https://example.com/a"), JobOptions::default()).await?;
    let fetch_b = queue
        .add(
            "fetch",
            json!("https://example.com/b"),
            JobOptions {
                depends_on: vec![fetch_a],
                ..Default::default()
            },
        )
        .await?;
    println!("chained {fetch_a} -> {fetch_b}");

    queue.add("flaky", json!({}), JobOptions::default()).await?;

    queue.drain().await?;
    let stats = queue.get_stats().await?;
    println!("{stats:?}");

    queue.shutdown().await?;
    Ok(())
}
