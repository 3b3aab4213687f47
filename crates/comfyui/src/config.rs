//! Session construction options.
//!
//! Everything a [`crate::session::Session`] can be tuned with is explicit
//! here; nothing is read from process-wide state at runtime.

use std::collections::HashMap;
use std::time::Duration;

use crate::reconnect::ReconnectConfig;

/// Documented default for the idle-channel timeout.
pub const DEFAULT_WS_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum upload size announced to the server (100 MB).
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 100 * 1024 * 1024;

/// Credentials attached to every HTTP request and the channel handshake.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// HTTP basic auth.
    Basic { username: String, password: String },
    /// Bearer token auth.
    Bearer(String),
    /// Arbitrary custom header set.
    Headers(HashMap<String, String>),
}

/// Capabilities the client announces to the server when the event channel
/// opens.
#[derive(Debug, Clone)]
pub struct FeatureFlags {
    /// Whether the client understands preview frames with metadata
    /// (binary kind 4).
    pub supports_preview_metadata: bool,
    /// Largest upload the client will attempt, in bytes.
    pub max_upload_size: u64,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            supports_preview_metadata: true,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
        }
    }
}

/// Tunable parameters for a single session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Extra headers added to every HTTP request.
    pub headers: HashMap<String, String>,
    /// Idle threshold for the event channel. If nothing has been seen for
    /// this long the watchdog forces a reconnect. The watchdog itself
    /// fires every `ws_timeout / 2`.
    pub ws_timeout: Duration,
    /// Emit terminal-log events from binary text frames.
    pub listen_terminal: bool,
    /// Optional credentials for protected servers.
    pub credentials: Option<Credentials>,
    /// Reconnect backoff controller settings.
    pub reconnect: ReconnectConfig,
    /// Announce [`FeatureFlags`] on channel open.
    pub announce_feature_flags: bool,
    /// Feature flags to announce.
    pub feature_flags: FeatureFlags,
    /// Log raw wire traffic at trace level.
    pub debug: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            ws_timeout: DEFAULT_WS_TIMEOUT,
            listen_terminal: false,
            credentials: None,
            reconnect: ReconnectConfig::default(),
            announce_feature_flags: true,
            feature_flags: FeatureFlags::default(),
            debug: false,
        }
    }
}
