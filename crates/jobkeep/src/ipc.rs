//! Wire format for parent/worker IPC. Framed as newline-delimited JSON
//! over the child's stdin/stdout, matching the message catalogue: `ready`,
//! `set-processor`, `execute`, `progress`, `result` from the parent's and
//! child's respective sides.
//!
//! Per the processor-shipping redesign, `set-processor` carries the
//! handler names the parent expects the child to already have registered
//! (the child is a re-exec of the same binary, so it built the identical
//! [`crate::registry::ProcessorRegistry`] from the embedding application's
//! own setup code) rather than a serialised function body.

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ParentMessage {
    SetProcessor { handlers: Vec<String> },
    Execute { job: Job },
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    pub fn ok(value: serde_json::Value) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChildMessage {
    Ready,
    ProcessorSet,
    Progress { job_id: JobId, progress: u8 },
    Result { job_id: JobId, result: JobResult },
}
