//! REST client for the ComfyUI HTTP endpoints.
//!
//! Wraps the surface dispatch requires (status probe, prompt submission,
//! queue snapshot, interrupt, memory free, image upload, system stats,
//! object info, history) using [`reqwest`]. Every outbound request touches
//! the shared activity tracker so the idle watchdog never fires during
//! bursty HTTP use.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use tokio::time::Instant;

use crate::config::{Credentials, SessionConfig};
use crate::messages::QueueStatus;

/// Maximum number of body bytes kept in an enqueue-failed error.
const BODY_SNIPPET_LIMIT: usize = 500;

/// Node class whose definition enumerates installed checkpoints.
const CHECKPOINT_LOADER_CLASS: &str = "CheckpointLoaderSimple";

// ---------------------------------------------------------------------------
// Activity tracking
// ---------------------------------------------------------------------------

/// Monotonic last-activity timestamp shared between the HTTP layer and the
/// connection watchdog.
#[derive(Clone)]
pub struct ActivityTracker {
    last: Arc<Mutex<Instant>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        *self.last.lock().unwrap() = Instant::now();
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.last.lock().unwrap().elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structured error for a rejected `POST /prompt`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Prompt rejected ({status} {status_text}): {reason}")]
pub struct EnqueueError {
    /// HTTP status code.
    pub status: u16,
    /// HTTP status text.
    pub status_text: String,
    /// Request URL.
    pub url: String,
    /// Request method.
    pub method: &'static str,
    /// Reason extracted from the response body.
    pub reason: String,
    /// Parsed JSON body, when the response was JSON.
    pub body_json: Option<serde_json::Value>,
    /// First bytes of the response body text.
    pub body_snippet: String,
}

/// Errors from the ComfyUI REST layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server rejected a prompt submission.
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    /// Any other non-2xx response.
    #[error("ComfyUI API error ({status}) for {method} {url}: {body}")]
    Api {
        status: u16,
        method: &'static str,
        url: String,
        body: String,
    },
}

/// Extract a human-readable reason from a rejection body.
///
/// Checks `error`, `message`, `detail`, the first entry of `errors[]`, and
/// the nested `{"error": {"message": ...}}` shape ComfyUI emits, falling
/// back to the raw snippet.
pub fn extract_reason(body_json: Option<&serde_json::Value>, snippet: &str) -> String {
    if let Some(json) = body_json {
        for key in ["error", "message", "detail"] {
            match json.get(key) {
                Some(serde_json::Value::String(s)) if !s.is_empty() => return s.clone(),
                Some(serde_json::Value::Object(obj)) => {
                    if let Some(msg) = obj.get("message").and_then(|v| v.as_str()) {
                        return msg.to_string();
                    }
                }
                _ => {}
            }
        }
        if let Some(first) = json.get("errors").and_then(|v| v.as_array()).and_then(|a| a.first()) {
            if let Some(s) = first.as_str() {
                return s.to_string();
            }
            if let Some(msg) = first.get("message").and_then(|v| v.as_str()) {
                return msg.to_string();
            }
            return first.to_string();
        }
    }
    if snippet.is_empty() {
        "unknown error".to_string()
    } else {
        snippet.to_string()
    }
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Response returned by `POST /prompt` after queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation diagnostics from the server.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// Snapshot of the server execution queue (`GET /queue`).
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue_running: Vec<serde_json::Value>,
    #[serde(default)]
    pub queue_pending: Vec<serde_json::Value>,
}

/// Response from `POST /upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedAsset {
    /// Filename as stored on the server.
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for a single ComfyUI server.
pub struct ComfyApi {
    client: reqwest::Client,
    base_url: String,
    activity: ActivityTracker,
}

impl ComfyApi {
    /// Build a client from session configuration.
    ///
    /// Headers and credentials become reqwest default headers so every
    /// request carries them.
    pub fn new(
        base_url: String,
        config: &SessionConfig,
        activity: ActivityTracker,
    ) -> Result<Self, ApiError> {
        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &config.headers {
            insert_header(&mut headers, name, value);
        }
        match &config.credentials {
            Some(Credentials::Basic { username, password }) => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                insert_header(&mut headers, "authorization", &format!("Basic {encoded}"));
            }
            Some(Credentials::Bearer(token)) => {
                insert_header(&mut headers, "authorization", &format!("Bearer {token}"));
            }
            Some(Credentials::Headers(map)) => {
                for (name, value) in map {
                    insert_header(&mut headers, name, value);
                }
            }
            None => {}
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            activity,
        })
    }

    /// Base HTTP URL of the server.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Lightweight status probe (`GET /prompt`).
    pub async fn prompt_status(&self) -> Result<QueueStatus, ApiError> {
        self.activity.touch();
        let url = format!("{}/prompt", self.base_url);
        let response = self.client.get(&url).send().await?;
        Self::parse_response(response, "GET", url).await
    }

    /// Submit a prompt payload (`POST /prompt`).
    ///
    /// Any non-2xx status is normalized into a structured
    /// [`EnqueueError`].
    pub async fn submit(&self, body: &serde_json::Value) -> Result<SubmitResponse, ApiError> {
        self.activity.touch();
        let url = format!("{}/prompt", self.base_url);
        let response = self.client.post(&url).json(body).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<SubmitResponse>().await?);
        }

        let text = response.text().await.unwrap_or_default();
        let snippet: String = text.chars().take(BODY_SNIPPET_LIMIT).collect();
        let body_json: Option<serde_json::Value> = serde_json::from_str(&text).ok();
        let reason = extract_reason(body_json.as_ref(), &snippet);

        Err(EnqueueError {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
            url,
            method: "POST",
            reason,
            body_json,
            body_snippet: snippet,
        }
        .into())
    }

    /// Full queue snapshot (`GET /queue`).
    pub async fn queue_snapshot(&self) -> Result<QueueSnapshot, ApiError> {
        self.activity.touch();
        let url = format!("{}/queue", self.base_url);
        let response = self.client.get(&url).send().await?;
        Self::parse_response(response, "GET", url).await
    }

    /// Request cancellation of a running or queued prompt
    /// (`POST /interrupt`).
    pub async fn interrupt(&self, prompt_id: &str) -> Result<(), ApiError> {
        self.activity.touch();
        let url = format!("{}/interrupt", self.base_url);
        let body = serde_json::json!({ "prompt_id": prompt_id });
        let response = self.client.post(&url).json(&body).send().await?;
        Self::check_status(response, "POST", url).await
    }

    /// Advisory memory release (`POST /free`).
    pub async fn free(&self, unload_models: bool, free_memory: bool) -> Result<(), ApiError> {
        self.activity.touch();
        let url = format!("{}/free", self.base_url);
        let body = serde_json::json!({
            "unload_models": unload_models,
            "free_memory": free_memory,
        });
        let response = self.client.post(&url).json(&body).send().await?;
        Self::check_status(response, "POST", url).await
    }

    /// Upload an attachment (`POST /upload/image`, multipart).
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        subfolder: Option<&str>,
        overwrite: bool,
    ) -> Result<UploadedAsset, ApiError> {
        self.activity.touch();
        let url = format!("{}/upload/image", self.base_url);

        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let mut form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", if overwrite { "true" } else { "false" });
        if let Some(subfolder) = subfolder {
            form = form.text("subfolder", subfolder.to_string());
        }

        let response = self.client.post(&url).multipart(form).send().await?;
        Self::parse_response(response, "POST", url).await
    }

    /// Host statistics (`GET /system_stats`), used for OS detection on
    /// init.
    pub async fn system_stats(&self) -> Result<serde_json::Value, ApiError> {
        self.activity.touch();
        let url = format!("{}/system_stats", self.base_url);
        let response = self.client.get(&url).send().await?;
        Self::parse_response(response, "GET", url).await
    }

    /// Node definition lookup (`GET /object_info[/<class>]`).
    pub async fn object_info(&self, class: Option<&str>) -> Result<serde_json::Value, ApiError> {
        self.activity.touch();
        let url = match class {
            Some(class) => format!("{}/object_info/{class}", self.base_url),
            None => format!("{}/object_info", self.base_url),
        };
        let response = self.client.get(&url).send().await?;
        Self::parse_response(response, "GET", url).await
    }

    /// Enumerate installed checkpoints from the loader node definition.
    pub async fn checkpoints(&self) -> Result<Vec<String>, ApiError> {
        let info = self.object_info(Some(CHECKPOINT_LOADER_CLASS)).await?;
        Ok(parse_checkpoint_list(&info))
    }

    /// Execution history for a prompt (`GET /history/{prompt_id}`).
    ///
    /// The returned JSON contains output file paths, node results, and
    /// timing data.
    pub async fn history(&self, prompt_id: &str) -> Result<serde_json::Value, ApiError> {
        self.activity.touch();
        let url = format!("{}/history/{prompt_id}", self.base_url);
        let response = self.client.get(&url).send().await?;
        Self::parse_response(response, "GET", url).await
    }

    // ---- private helpers ----

    async fn ensure_success(
        response: reqwest::Response,
        method: &'static str,
        url: String,
    ) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Api {
                status: status.as_u16(),
                method,
                url,
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        method: &'static str,
        url: String,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response, method, url).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(
        response: reqwest::Response,
        method: &'static str,
        url: String,
    ) -> Result<(), ApiError> {
        Self::ensure_success(response, method, url).await?;
        Ok(())
    }
}

/// Pull the checkpoint filename list out of an `object_info` response.
///
/// The list lives at `<class>.input.required.ckpt_name[0]`.
pub fn parse_checkpoint_list(info: &serde_json::Value) -> Vec<String> {
    info.get(CHECKPOINT_LOADER_CLASS)
        .and_then(|class| class.get("input"))
        .and_then(|input| input.get("required"))
        .and_then(|required| required.get("ckpt_name"))
        .and_then(|ckpt| ckpt.get(0))
        .and_then(|list| list.as_array())
        .map(|names| {
            names
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn insert_header(headers: &mut reqwest::header::HeaderMap, name: &str, value: &str) {
    let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) else {
        tracing::warn!(header = name, "Ignoring invalid header name");
        return;
    };
    let Ok(value) = reqwest::header::HeaderValue::from_str(value) else {
        tracing::warn!(header = %name, "Ignoring invalid header value");
        return;
    };
    headers.insert(name, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -- extract_reason -------------------------------------------------------

    #[test]
    fn reason_from_error_string() {
        let body = json!({"error": "value out of range"});
        assert_eq!(extract_reason(Some(&body), ""), "value out of range");
    }

    #[test]
    fn reason_from_nested_error_object() {
        let body = json!({"error": {"type": "prompt_outputs_failed_validation", "message": "Prompt outputs failed validation"}});
        assert_eq!(
            extract_reason(Some(&body), ""),
            "Prompt outputs failed validation"
        );
    }

    #[test]
    fn reason_from_message_and_detail() {
        assert_eq!(
            extract_reason(Some(&json!({"message": "busy"})), ""),
            "busy"
        );
        assert_eq!(
            extract_reason(Some(&json!({"detail": "not found"})), ""),
            "not found"
        );
    }

    #[test]
    fn reason_from_errors_array() {
        let body = json!({"errors": ["first problem", "second"]});
        assert_eq!(extract_reason(Some(&body), ""), "first problem");

        let body = json!({"errors": [{"message": "structured problem"}]});
        assert_eq!(extract_reason(Some(&body), ""), "structured problem");
    }

    #[test]
    fn reason_falls_back_to_snippet() {
        assert_eq!(
            extract_reason(None, "<html>502 Bad Gateway</html>"),
            "<html>502 Bad Gateway</html>"
        );
        assert_eq!(extract_reason(None, ""), "unknown error");
    }

    // -- parse_checkpoint_list ------------------------------------------------

    #[test]
    fn checkpoint_list_extraction() {
        let info = json!({
            "CheckpointLoaderSimple": {
                "input": {
                    "required": {
                        "ckpt_name": [["sd_xl_base.safetensors", "dreamshaper.safetensors"], {}]
                    }
                }
            }
        });
        assert_eq!(
            parse_checkpoint_list(&info),
            vec!["sd_xl_base.safetensors", "dreamshaper.safetensors"]
        );
    }

    #[test]
    fn checkpoint_list_missing_is_empty() {
        assert!(parse_checkpoint_list(&json!({})).is_empty());
        assert!(parse_checkpoint_list(&json!({"CheckpointLoaderSimple": {}})).is_empty());
    }
}
