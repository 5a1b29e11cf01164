//! Error taxonomy. Every variant here is one of the error kinds in the
//! queue's error handling design: construction-time validation errors are
//! fatal, execution errors flow back through the retry pipeline, and
//! storage/IO errors propagate to the caller.

use crate::job::JobId;

/// Whether an error should consume a retry attempt or end the job
/// immediately. Mirrors the teacher's `Categorizable`/`SafeErrorCategory`
/// split, generalized from arbitrary command failures to job execution
/// failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Consumes a retry attempt; the job re-enters the pipeline via backoff.
    Retryable,
    /// Not part of the retry pipeline at all (e.g. a config or shutdown error).
    Terminal,
}

pub trait Categorizable {
    fn category(&self) -> ErrorCategory;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("no job with id {0} in storage")]
    StorageNotFound(JobId),

    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("storage is closed")]
    StorageClosed,

    #[error("invalid cron pattern {pattern:?}: {reason}")]
    InvalidCron { pattern: String, reason: String },

    #[error("worker failed to become ready within the init deadline")]
    WorkerInitTimeout,

    #[error("worker crashed: code={code:?}, signal={signal:?}")]
    WorkerCrashed {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("processor error: {0}")]
    ProcessorError(String),

    #[error("no processor registered for handler {0:?}")]
    UnknownHandler(String),

    #[error("queue is shutting down")]
    ShuttingDown,
}

impl Categorizable for QueueError {
    fn category(&self) -> ErrorCategory {
        match self {
            QueueError::WorkerInitTimeout
            | QueueError::WorkerCrashed { .. }
            | QueueError::ProcessorError(_) => ErrorCategory::Retryable,
            QueueError::ConfigInvalid(_)
            | QueueError::StorageNotFound(_)
            | QueueError::StorageIo(_)
            | QueueError::StorageClosed
            | QueueError::InvalidCron { .. }
            | QueueError::UnknownHandler(_)
            | QueueError::ShuttingDown => ErrorCategory::Terminal,
        }
    }
}
