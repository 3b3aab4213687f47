//! Events emitted by a session.
//!
//! One broadcast stream per session carries everything the manager and the
//! per-job runners need: connection lifecycle, execution progress, preview
//! frames, and terminal output.

use fanout_core::types::PromptId;

use crate::messages::ExecutionErrorData;

/// An event observed on (or synthesized for) a single session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The event channel opened for the first time.
    Connected,
    /// The event channel re-opened after a drop.
    Reconnected,
    /// The event channel closed for any reason.
    Disconnected,
    /// The reconnect controller gave up after exhausting its attempts.
    ReconnectionFailed,

    /// Queue depth update, server-sent or synthesized by the polling
    /// fallback.
    Status { queue_remaining: i32 },

    /// The server began executing a prompt.
    ExecutionStart { prompt_id: PromptId },
    /// The server reused cached outputs for the listed nodes.
    ExecutionCached {
        prompt_id: PromptId,
        nodes: Vec<String>,
    },
    /// A node began executing; `node == None` marks prompt completion.
    Executing {
        prompt_id: PromptId,
        node: Option<String>,
    },
    /// Intra-node progress.
    Progress {
        prompt_id: Option<PromptId>,
        node: Option<String>,
        value: i32,
        max: i32,
    },
    /// A node finished and produced output.
    Executed {
        prompt_id: PromptId,
        node: String,
        output: serde_json::Value,
    },
    /// The full prompt finished.
    ExecutionSuccess { prompt_id: PromptId },
    /// The prompt failed.
    ExecutionError(ExecutionErrorData),

    /// Legacy preview frame (binary kind 1/2).
    Preview { mime: String, image: Vec<u8> },
    /// Preview frame with structured metadata (binary kind 4).
    PreviewMeta {
        metadata: serde_json::Value,
        mime: String,
        image: Vec<u8>,
    },
    /// Terminal log text (binary kind 3), when enabled.
    Terminal { channel: u32, text: String },
}
