//! Events emitted by the pool.
//!
//! A single broadcast stream carries job lifecycle events and client state
//! changes. Within one job, events are observed in the order the runner
//! produces them; completion, failure, and cancellation are terminal.

use std::time::Duration;

use fanout_core::types::{JobId, PromptId, SessionId};

use crate::job::JobResult;

/// A pool-level event.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// The pool is constructed and its dispatcher is running.
    Ready,
    /// A non-job-specific failure (queue adapter errors and the like).
    PoolError { message: String },

    /// A job entered the queue (also re-emitted after a retry re-enqueue).
    JobQueued { job_id: JobId },
    /// A job was assigned to a session.
    JobAccepted { job_id: JobId, session_id: SessionId },
    /// First event carrying the server-assigned prompt id.
    JobStarted {
        job_id: JobId,
        session_id: SessionId,
        prompt_id: PromptId,
    },
    /// Intra-node progress.
    JobProgress {
        job_id: JobId,
        node: Option<String>,
        value: i32,
        max: i32,
    },
    /// Legacy preview frame for the running job.
    JobPreview {
        job_id: JobId,
        mime: String,
        image: Vec<u8>,
    },
    /// Preview frame with structured metadata.
    JobPreviewMeta {
        job_id: JobId,
        metadata: serde_json::Value,
        mime: String,
        image: Vec<u8>,
    },
    /// A node finished and produced output.
    JobOutput {
        job_id: JobId,
        node: String,
        output: serde_json::Value,
    },
    /// Terminal: the job finished successfully.
    JobCompleted { job_id: JobId, result: JobResult },
    /// The attempt failed; terminal when `will_retry` is false.
    JobFailed {
        job_id: JobId,
        error: String,
        will_retry: bool,
    },
    /// A retry was scheduled after the given delay.
    JobRetrying {
        job_id: JobId,
        delay: Duration,
        attempt: u32,
    },
    /// Terminal: the job was cancelled.
    JobCancelled { job_id: JobId },

    /// A managed session changed state.
    ClientState {
        session_id: SessionId,
        online: bool,
        busy: bool,
    },
    /// The strategy blocked a session for a workflow fingerprint.
    ClientBlockedWorkflow {
        session_id: SessionId,
        fingerprint: String,
    },
    /// A success cleared an active block.
    ClientUnblockedWorkflow {
        session_id: SessionId,
        fingerprint: String,
    },
}
