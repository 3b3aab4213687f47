//! One session per ComfyUI server.
//!
//! A [`Session`] owns the HTTP client, the long-lived event channel, and
//! the reconnect machinery for a single server. It is constructed lazily,
//! brought up by [`Session::init`], and torn down by [`Session::destroy`].
//! At most one connection attempt is in flight at any time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use fanout_core::types::SessionId;

use crate::api::{
    ActivityTracker, ApiError, ComfyApi, QueueSnapshot, SubmitResponse, UploadedAsset,
};
use crate::config::{FeatureFlags, SessionConfig};
use crate::events::SessionEvent;
use crate::poller::polling_fallback;
use crate::processor::{process_messages, ProcessorContext, ProcessorExit, WsStream};
use crate::reconnect::{reconnect_loop, ReconnectOutcome};
use crate::transport::{
    ConnectionState, SessionTransport, SubmitPosition, UploadOptions,
};

/// Broadcast channel capacity for session events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long `destroy` waits for the connection task to exit.
const DESTROY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from session lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The initial reachability probe never succeeded.
    #[error("Server unreachable after {attempts} attempts: {last_error}")]
    Unreachable { attempts: u32, last_error: String },

    /// An underlying HTTP call failed.
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Optional capabilities probed once during `init`.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// The server answered the checkpoint loader definition lookup.
    pub checkpoint_listing: bool,
    /// The server answered `system_stats`.
    pub system_stats: bool,
    /// Operating system reported by the server, when known.
    pub os: Option<String>,
}

/// The core's handle on one ComfyUI server.
pub struct Session {
    url: String,
    session_id: Arc<RwLock<SessionId>>,
    api: Arc<ComfyApi>,
    config: SessionConfig,
    activity: ActivityTracker,
    event_tx: broadcast::Sender<SessionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    capabilities: RwLock<Capabilities>,
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Session {
    /// Create a session for the server at `url` (e.g. `http://host:8188`).
    ///
    /// Generates a UUID v4 client id; the server may later replace it via
    /// `sid`. No connection is attempted until [`init`](Self::init).
    pub fn new(url: impl Into<String>, config: SessionConfig) -> Result<Self, SessionError> {
        let url = url.into().trim_end_matches('/').to_string();
        let activity = ActivityTracker::new();
        let api = Arc::new(ComfyApi::new(url.clone(), &config, activity.clone())?);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        Ok(Self {
            url,
            session_id: Arc::new(RwLock::new(uuid::Uuid::new_v4().to_string())),
            api,
            config,
            activity,
            event_tx,
            state_tx,
            state_rx,
            capabilities: RwLock::new(Capabilities::default()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Capabilities probed during init.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.read().unwrap().clone()
    }

    /// Bring the session up.
    ///
    /// Probes reachability over HTTP (up to `max_retries` attempts,
    /// `retry_delay` apart), records optional capabilities, then opens the
    /// event channel in the background. Resolves once the channel is open
    /// or the polling fallback has engaged; fails only when the
    /// reachability probe exhausts its retries.
    pub async fn init(&self, max_retries: u32, retry_delay: Duration) -> Result<(), SessionError> {
        let attempts = max_retries.max(1);
        let mut last_error = String::new();
        let mut reachable = false;
        for attempt in 1..=attempts {
            match self.api.prompt_status().await {
                Ok(_) => {
                    reachable = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        url = %self.url,
                        attempt,
                        error = %e,
                        "Reachability probe failed",
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(retry_delay).await;
            }
        }
        if !reachable {
            return Err(SessionError::Unreachable {
                attempts,
                last_error,
            });
        }

        self.probe_capabilities().await;
        self.spawn_connection_task();

        // Wait for the channel to open or the polling fallback to engage.
        let mut state_rx = self.state_rx.clone();
        while matches!(*state_rx.borrow(), ConnectionState::Connecting) {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Advisory memory release. Failures are logged and ignored.
    pub async fn free(&self, unload_models: bool, free_memory: bool) {
        if let Err(e) = self.api.free(unload_models, free_memory).await {
            tracing::warn!(url = %self.url, error = %e, "Memory free request failed");
        }
    }

    /// Host statistics as reported by the server.
    pub async fn system_stats(&self) -> Result<serde_json::Value, ApiError> {
        self.api.system_stats().await
    }

    /// Node definition lookup, for the whole registry or one class.
    pub async fn object_info(&self, class: Option<&str>) -> Result<serde_json::Value, ApiError> {
        self.api.object_info(class).await
    }

    // ---- private helpers ----

    /// Probe optional capabilities once; absence is recorded, not an
    /// error.
    async fn probe_capabilities(&self) {
        let mut caps = Capabilities::default();

        match self.api.system_stats().await {
            Ok(stats) => {
                caps.system_stats = true;
                caps.os = stats
                    .get("system")
                    .and_then(|s| s.get("os"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
            }
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "system_stats probe failed");
            }
        }

        match self.api.checkpoints().await {
            Ok(_) => caps.checkpoint_listing = true,
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Checkpoint listing probe failed");
            }
        }

        tracing::info!(
            url = %self.url,
            checkpoint_listing = caps.checkpoint_listing,
            os = caps.os.as_deref().unwrap_or("unknown"),
            "Session capabilities probed",
        );
        *self.capabilities.write().unwrap() = caps;
    }

    /// Spawn the connect -> process -> reconnect loop. Idempotent.
    fn spawn_connection_task(&self) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }

        let ctx = ConnCtx {
            url: self.url.clone(),
            session_id: Arc::clone(&self.session_id),
            api: Arc::clone(&self.api),
            event_tx: self.event_tx.clone(),
            state_tx: self.state_tx.clone(),
            activity: self.activity.clone(),
            config: self.config.clone(),
        };
        let cancel = self.cancel.clone();

        *task = Some(tokio::spawn(async move {
            tracing::info!(url = %ctx.url, "Starting connection task");
            run_connection_loop(ctx, cancel).await;
            tracing::info!("Connection task exited");
        }));
    }
}

#[async_trait]
impl SessionTransport for Session {
    fn id(&self) -> SessionId {
        self.session_id.read().unwrap().clone()
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    async fn submit(
        &self,
        prompt: serde_json::Value,
        extra_data: Option<serde_json::Value>,
        position: SubmitPosition,
    ) -> Result<SubmitResponse, ApiError> {
        let mut body = serde_json::json!({
            "client_id": self.id(),
            "prompt": prompt,
            "extra_data": extra_data.unwrap_or_else(|| serde_json::json!({})),
        });
        match position {
            SubmitPosition::Front => {
                body["front"] = serde_json::Value::Bool(true);
            }
            SubmitPosition::At(index) => {
                body["number"] = serde_json::Value::from(index);
            }
            SubmitPosition::Append | SubmitPosition::Auto => {}
        }
        self.api.submit(&body).await
    }

    async fn interrupt(&self, prompt_id: &str) -> Result<(), ApiError> {
        self.api.interrupt(prompt_id).await
    }

    async fn upload_asset(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        options: UploadOptions,
    ) -> Result<UploadedAsset, ApiError> {
        self.api
            .upload_image(bytes, filename, options.subfolder.as_deref(), options.overwrite)
            .await
    }

    async fn queue_status(&self) -> Result<QueueSnapshot, ApiError> {
        self.api.queue_snapshot().await
    }

    async fn checkpoints(&self) -> Result<Vec<String>, ApiError> {
        self.api.checkpoints().await
    }

    async fn history(&self, prompt_id: &str) -> Result<serde_json::Value, ApiError> {
        self.api.history(prompt_id).await
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(url = %self.url, "Destroying session");
        self.cancel.cancel();

        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(DESTROY_DRAIN_TIMEOUT, task).await;
        }
        let _ = self.state_tx.send(ConnectionState::Destroyed);
    }
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

/// Everything the connection task needs, detached from the `Session`.
struct ConnCtx {
    url: String,
    session_id: Arc<RwLock<SessionId>>,
    api: Arc<ComfyApi>,
    event_tx: broadcast::Sender<SessionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    activity: ActivityTracker,
    config: SessionConfig,
}

impl ConnCtx {
    fn current_id(&self) -> String {
        self.session_id.read().unwrap().clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }
}

/// Derive the event channel URL from the HTTP base URL.
fn channel_url(base: &str, client_id: &str) -> String {
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}/ws?clientId={client_id}")
}

/// One channel open attempt.
async fn connect_channel(
    base: &str,
    client_id: &str,
) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
    let url = channel_url(base, client_id);
    let (stream, _response) = connect_async(&url).await?;
    Ok(stream)
}

/// Send the feature-flag announcement on a freshly opened channel.
async fn announce_feature_flags(stream: &mut WsStream, flags: &FeatureFlags) {
    let msg = serde_json::json!({
        "type": "feature_flags",
        "data": {
            "supports_preview_metadata": flags.supports_preview_metadata,
            "max_upload_size": flags.max_upload_size,
        },
    });
    if let Err(e) = stream.send(Message::Text(msg.to_string())).await {
        tracing::warn!(error = %e, "Failed to announce feature flags");
    }
}

/// Core loop: connect -> announce -> process -> reconnect.
///
/// A channel that never opened falls back to HTTP polling with periodic
/// channel retries. A channel that drops after opening goes through the
/// backoff controller; exhausting it emits the terminal
/// `reconnection_failed` event and ends the task.
async fn run_connection_loop(ctx: ConnCtx, cancel: CancellationToken) {
    let mut ever_connected = false;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let stream = match connect_channel(&ctx.url, &ctx.current_id()).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(url = %ctx.url, error = %e, "Event channel open failed");
                if ever_connected {
                    ctx.set_state(ConnectionState::Reconnecting);
                    let outcome = reconnect_loop(
                        || {
                            let url = ctx.url.clone();
                            let id = ctx.current_id();
                            async move { connect_channel(&url, &id).await }
                        },
                        &ctx.config.reconnect,
                        &cancel,
                    )
                    .await;
                    match outcome {
                        ReconnectOutcome::Connected(stream) => stream,
                        ReconnectOutcome::Exhausted => {
                            let _ = ctx.event_tx.send(SessionEvent::ReconnectionFailed);
                            return;
                        }
                        ReconnectOutcome::Cancelled => return,
                    }
                } else {
                    ctx.set_state(ConnectionState::PollingFallback);
                    let stream = polling_fallback(
                        &ctx.api,
                        &ctx.event_tx,
                        || {
                            let url = ctx.url.clone();
                            let id = ctx.current_id();
                            async move { connect_channel(&url, &id).await }
                        },
                        &cancel,
                    )
                    .await;
                    match stream {
                        Some(stream) => stream,
                        None => return, // cancelled
                    }
                }
            }
        };

        let mut stream = stream;
        if ctx.config.announce_feature_flags {
            announce_feature_flags(&mut stream, &ctx.config.feature_flags).await;
        }

        ctx.activity.touch();
        ctx.set_state(ConnectionState::Open);
        if ever_connected {
            let _ = ctx.event_tx.send(SessionEvent::Reconnected);
        } else {
            ever_connected = true;
            let _ = ctx.event_tx.send(SessionEvent::Connected);
        }

        let proc_ctx = ProcessorContext {
            session_id: Arc::clone(&ctx.session_id),
            event_tx: ctx.event_tx.clone(),
            activity: ctx.activity.clone(),
            ws_timeout: ctx.config.ws_timeout,
            listen_terminal: ctx.config.listen_terminal,
            debug: ctx.config.debug,
        };
        let exit = process_messages(&mut stream, &proc_ctx, &cancel).await;

        let _ = ctx.event_tx.send(SessionEvent::Disconnected);
        ctx.set_state(ConnectionState::Reconnecting);

        match exit {
            ProcessorExit::Cancelled => return,
            ProcessorExit::ChannelClosed | ProcessorExit::IdleTimeout => {
                tracing::info!(url = %ctx.url, ?exit, "Event channel lost, reconnecting");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_url_swaps_scheme_and_appends_client_id() {
        assert_eq!(
            channel_url("http://host:8188", "abc"),
            "ws://host:8188/ws?clientId=abc"
        );
        assert_eq!(
            channel_url("https://host", "abc"),
            "wss://host/ws?clientId=abc"
        );
    }

    #[test]
    fn new_session_starts_connecting_with_uuid_id() {
        let session = Session::new("http://localhost:8188/", SessionConfig::default()).unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.url(), "http://localhost:8188");
        assert!(uuid::Uuid::parse_str(&session.id()).is_ok());
    }
}
