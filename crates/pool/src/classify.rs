//! Failure classification.
//!
//! Every failed attempt is classified into a [`FailureKind`], which
//! drives three decisions: whether the error is retryable at all, whether
//! the session should be blocked for this workflow (strategy cooldown)
//! or permanently excluded for this job, and whether any session can
//! still run the job.

use fanout_comfyui::api::EnqueueError;
use fanout_comfyui::messages::ExecutionErrorData;

/// Message fragments that indicate the server is missing an asset the
/// workflow needs (checkpoint, LoRA, custom node, ...).
const MISSING_ASSET_SUBJECTS: &[&str] = &[
    "ckpt",
    "checkpoint",
    "lora",
    "model",
    "custom node",
    "node type",
    "node_type",
    "embedding",
    "vae",
];

const MISSING_ASSET_VERBS: &[&str] = &[
    "not in list",
    "not found",
    "does not exist",
    "missing",
    "failed to load",
    "no such file",
    "could not find",
    "unknown",
];

/// Message fragments that look environmental rather than caused by the
/// workflow itself.
const TRANSIENT_PATTERNS: &[&str] = &[
    "out of memory",
    "oom",
    "cuda",
    "device-side assert",
    "allocation failed",
    "connection reset",
];

/// Message fragments that indicate the workflow itself is invalid and
/// would fail everywhere.
const VALIDATION_PATTERNS: &[&str] = &[
    "invalid prompt",
    "invalid input",
    "bad input",
    "must be",
    "out of range",
    "expected type",
    "type mismatch",
    "failed validation",
    "prompt_outputs_failed_validation",
    "prompt has no outputs",
];

/// Classified failure reason for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transport-level failure (channel drop, upload failure, event
    /// stream loss).
    Transport,
    /// The server rejected the submission for a reason that does not
    /// implicate the workflow/server pairing.
    EnqueueRejected,
    /// The server cannot run this workflow (missing checkpoint, LoRA,
    /// custom node).
    WorkflowIncompatible,
    /// Environmental execution failure (OOM, CUDA fault).
    TransientExecution,
    /// The workflow itself is invalid; it would fail on any server.
    WorkflowInvalid,
    /// No `execution_start` arrived within the window.
    ExecutionStartTimeout,
    /// A node made no progress within the window.
    NodeExecutionTimeout,
    /// Caller-initiated cancellation.
    Cancelled,
}

impl FailureKind {
    /// Whether another attempt may succeed (possibly on another session).
    pub fn retryable(&self) -> bool {
        match self {
            FailureKind::Transport
            | FailureKind::EnqueueRejected
            | FailureKind::WorkflowIncompatible
            | FailureKind::TransientExecution
            | FailureKind::ExecutionStartTimeout
            | FailureKind::NodeExecutionTimeout => true,
            FailureKind::WorkflowInvalid | FailureKind::Cancelled => false,
        }
    }

    /// Whether the strategy should count this failure against the
    /// (session, fingerprint) pair.
    pub fn blocks_session(&self) -> bool {
        matches!(self, FailureKind::WorkflowIncompatible)
    }

    /// Whether the session is permanently excluded for this job.
    pub fn excludes_session(&self) -> bool {
        matches!(self, FailureKind::WorkflowIncompatible)
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn looks_incompatible(message: &str) -> bool {
    contains_any(message, MISSING_ASSET_SUBJECTS) && contains_any(message, MISSING_ASSET_VERBS)
}

/// Classify an `execution_error` event.
pub fn classify_execution_error(data: &ExecutionErrorData) -> FailureKind {
    let message = format!(
        "{} {}",
        data.exception_type.to_lowercase(),
        data.exception_message.to_lowercase()
    );

    if looks_incompatible(&message) {
        return FailureKind::WorkflowIncompatible;
    }
    if contains_any(&message, TRANSIENT_PATTERNS) {
        return FailureKind::TransientExecution;
    }
    if contains_any(&message, VALIDATION_PATTERNS) {
        return FailureKind::WorkflowInvalid;
    }
    // Unrecognized execution errors are treated as environmental: retry
    // elsewhere without blocking the pairing.
    FailureKind::TransientExecution
}

/// Classify a rejected `POST /prompt`.
pub fn classify_enqueue_error(error: &EnqueueError) -> FailureKind {
    let mut message = error.reason.to_lowercase();
    if let Some(body) = &error.body_json {
        message.push(' ');
        message.push_str(&body.to_string().to_lowercase());
    }

    if looks_incompatible(&message) {
        return FailureKind::WorkflowIncompatible;
    }
    if contains_any(&message, VALIDATION_PATTERNS) {
        return FailureKind::WorkflowInvalid;
    }
    FailureKind::EnqueueRejected
}
