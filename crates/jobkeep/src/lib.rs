//! # jobkeep
//!
//! An embeddable, single-node durable job queue: priority/FIFO scheduling,
//! delayed and recurring jobs, dependency ordering, exponential or fixed
//! backoff, a dead-letter queue, a stalled-job sweeper and crash recovery,
//! with job execution isolated in child worker processes.
//!
//! ## Architecture
//!
//! ```text
//! Queue::add() ──► Storage (durable record)
//!                      │
//!                      ▼ 200ms tick
//!                  Scheduler ──► offers ready jobs
//!                      │
//!                      ▼ admission rules (concurrency, deps, rate limit)
//!                   Queue (RuntimeState behind one Mutex)
//!                      │
//!                      ▼ execute()
//!                  Worker ◄── NDJSON over stdin/stdout ──► worker_host::run()
//!                      │                                        │
//!                      ▼                                        ▼
//!               success/failure                          ProcessorRegistry
//!               (backoff / DLQ)
//! ```
//!
//! ## Key invariants
//!
//! 1. A job occupies exactly one of the seven lifecycle states at a time.
//! 2. `processing` is the only state with more than one successor:
//!    `completed`, `pending` (retry), `failed` (DLQ) or `stalled`.
//! 3. The scheduler only orders and offers; the runtime alone admits.
//! 4. Storage implementations own durability; the runtime never assumes
//!    more about a backend than the `Storage` trait promises.
//! 5. Job execution happens in a separate OS process: a worker crash
//!    degrades one in-flight job, not the embedding application.
//!
//! Construct a queue with [`QueueBuilder`], register processors with
//! [`ProcessorRegistryBuilder`], and pick a [`Storage`] backend (this crate
//! ships [`MemoryStorage`]; see the sibling `jobkeep-file` crate for
//! filesystem durability).

pub mod backoff;
pub mod config;
pub mod cron;
pub mod error;
pub mod events;
pub mod ipc;
pub mod job;
pub mod ratelimit;
pub mod registry;
pub mod repeat;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod worker;
pub mod worker_host;

pub use backoff::{BackoffKind, BackoffPolicy, MAX_BACKOFF_MS};
pub use config::{QueueConfig, RetryConfig};
pub use cron::CronSchedule;
pub use error::{Categorizable, ErrorCategory, QueueError};
pub use events::{EventBus, EventSubscriber, JobEvent};
pub use job::{Job, JobId, JobOptions, JobStatus, RepeatConfig, RepeatSchedule};
pub use ratelimit::{RateLimiter, RateLimiterConfig};
pub use registry::{JobContext, Processor, ProcessorRegistry, ProcessorRegistryBuilder};
pub use runtime::{Queue, QueueBuilder, QueueStats};
pub use storage::{MemoryStorage, Storage};
pub use worker::{LocalWorker, Worker, WorkerHandle, WORKER_MODE_ENV};
