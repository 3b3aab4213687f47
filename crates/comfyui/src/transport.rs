//! The capability set the pool consumes from a session.
//!
//! [`SessionTransport`] is the seam between scheduling and transport:
//! the pool's manager, runners, and tests depend on this trait, never on
//! the concrete [`crate::session::Session`].

use async_trait::async_trait;
use tokio::sync::broadcast;

use fanout_core::types::SessionId;

use crate::api::{ApiError, QueueSnapshot, SubmitResponse, UploadedAsset};
use crate::events::SessionEvent;

/// Queue placement for a submitted prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmitPosition {
    /// Let the server append at the back (its default).
    #[default]
    Append,
    /// Jump the queue.
    Front,
    /// Explicit queue index.
    At(u32),
    /// Server decides.
    Auto,
}

/// Options for an attachment upload.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub subfolder: Option<String>,
    pub overwrite: bool,
}

/// Connection lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Brought up but the first channel open has not finished.
    Connecting,
    /// Event channel live.
    Open,
    /// Channel dropped; the backoff controller is running.
    Reconnecting,
    /// Channel never opened; synthesizing status from HTTP polls.
    PollingFallback,
    /// Torn down.
    Destroyed,
}

/// The full surface scheduling requires from one server.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Current client id (may change if the server assigns a `sid`).
    fn id(&self) -> SessionId;

    /// Base HTTP URL of the server.
    fn url(&self) -> String;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Subscribe to the session's event stream.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    /// Submit a workflow. `extra_data` rides alongside the graph and
    /// carries client-side bookkeeping such as output aliases.
    async fn submit(
        &self,
        prompt: serde_json::Value,
        extra_data: Option<serde_json::Value>,
        position: SubmitPosition,
    ) -> Result<SubmitResponse, ApiError>;

    /// Request cancellation of a running or queued prompt.
    async fn interrupt(&self, prompt_id: &str) -> Result<(), ApiError>;

    /// Upload an attachment before dispatch.
    async fn upload_asset(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        options: UploadOptions,
    ) -> Result<UploadedAsset, ApiError>;

    /// Snapshot of the server queue; used by health pings and idle
    /// checks.
    async fn queue_status(&self) -> Result<QueueSnapshot, ApiError>;

    /// Installed checkpoint filenames.
    async fn checkpoints(&self) -> Result<Vec<String>, ApiError>;

    /// Execution history for a prompt; used to backfill outputs missing
    /// from the live stream.
    async fn history(&self, prompt_id: &str) -> Result<serde_json::Value, ApiError>;

    /// Tear the session down. Idempotent.
    async fn destroy(&self);
}
