//! ComfyUI text message types and parser.
//!
//! ComfyUI sends JSON messages over the event channel with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them into
//! a strongly-typed [`ComfyMessage`] enum and extracts the server-assigned
//! `sid` when one is present.

use serde::Deserialize;

/// All known ComfyUI text message types.
///
/// Deserialized via the internally-tagged `"type"` field with associated
/// `"data"` content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyMessage {
    /// Server status broadcast (queue depth, etc.).
    #[serde(rename = "status")]
    Status(StatusData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(ExecutionStartData),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A specific node is executing (or the prompt finished when `node`
    /// is `None`).
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Progress update from a long-running node (e.g. KSampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node has finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// The full prompt finished successfully.
    #[serde(rename = "execution_success")]
    ExecutionSuccess(ExecutionSuccessData),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ExecutionErrorData),
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

/// Current queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload for `execution_start` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the prompt has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: String,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: i32,
    /// Total number of steps.
    pub max: i32,
    /// Prompt this progress belongs to. Older servers omit it.
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Node emitting the progress, when the server includes it.
    #[serde(default)]
    pub node: Option<String>,
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// The node that produced this output.
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// Payload for `execution_success` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSuccessData {
    pub prompt_id: String,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionErrorData {
    pub prompt_id: String,
    pub node_id: String,
    #[serde(default)]
    pub node_type: String,
    pub exception_message: String,
    pub exception_type: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Parse a ComfyUI text message into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values. Callers log
/// unknown types and continue.
pub fn parse_message(text: &str) -> Result<ComfyMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Extract `data.sid` from a raw message, if present.
///
/// The server includes its session id in the first status broadcast (and
/// may repeat it); the client adopts it as its own id.
pub fn extract_sid(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value
        .get("data")?
        .get("sid")?
        .as_str()
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_message() {
        let json = r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":3}}}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyMessage::Status(data) => {
                assert_eq!(data.status.exec_info.queue_remaining, 3);
            }
            other => panic!("Expected Status, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_start_message() {
        let json = r#"{"type":"execution_start","data":{"prompt_id":"abc-123"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyMessage::ExecutionStart(data) => {
                assert_eq!(data.prompt_id, "abc-123");
            }
            other => panic!("Expected ExecutionStart, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_cached_without_nodes() {
        let json = r#"{"type":"execution_cached","data":{"prompt_id":"abc"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyMessage::ExecutionCached(data) => {
                assert!(data.nodes.is_empty());
            }
            other => panic!("Expected ExecutionCached, got {other:?}"),
        }
    }

    #[test]
    fn parse_executing_with_node() {
        let json = r#"{"type":"executing","data":{"node":"42","prompt_id":"xyz"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyMessage::Executing(data) => {
                assert_eq!(data.node.as_deref(), Some("42"));
                assert_eq!(data.prompt_id, "xyz");
            }
            other => panic!("Expected Executing, got {other:?}"),
        }
    }

    #[test]
    fn parse_executing_finished() {
        let json = r#"{"type":"executing","data":{"node":null,"prompt_id":"xyz"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyMessage::Executing(data) => {
                assert!(data.node.is_none());
            }
            other => panic!("Expected Executing, got {other:?}"),
        }
    }

    #[test]
    fn parse_progress_with_and_without_prompt_id() {
        let bare = r#"{"type":"progress","data":{"value":5,"max":20}}"#;
        match parse_message(bare).unwrap() {
            ComfyMessage::Progress(data) => {
                assert_eq!(data.value, 5);
                assert_eq!(data.max, 20);
                assert!(data.prompt_id.is_none());
            }
            other => panic!("Expected Progress, got {other:?}"),
        }

        let full = r#"{"type":"progress","data":{"value":1,"max":4,"prompt_id":"p","node":"3"}}"#;
        match parse_message(full).unwrap() {
            ComfyMessage::Progress(data) => {
                assert_eq!(data.prompt_id.as_deref(), Some("p"));
                assert_eq!(data.node.as_deref(), Some("3"));
            }
            other => panic!("Expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn parse_executed_message() {
        let json = r#"{"type":"executed","data":{"node":"9","output":{"images":[{"filename":"out.png"}]},"prompt_id":"abc"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyMessage::Executed(data) => {
                assert_eq!(data.node, "9");
                assert_eq!(data.prompt_id, "abc");
                assert!(data.output.is_object());
            }
            other => panic!("Expected Executed, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_success_message() {
        let json = r#"{"type":"execution_success","data":{"prompt_id":"abc"}}"#;
        match parse_message(json).unwrap() {
            ComfyMessage::ExecutionSuccess(data) => assert_eq!(data.prompt_id, "abc"),
            other => panic!("Expected ExecutionSuccess, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_error_message() {
        let json = r#"{"type":"execution_error","data":{"prompt_id":"abc","node_id":"5","node_type":"KSampler","exception_message":"out of memory","exception_type":"RuntimeError","traceback":["line 1","line 2"]}}"#;
        match parse_message(json).unwrap() {
            ComfyMessage::ExecutionError(data) => {
                assert_eq!(data.prompt_id, "abc");
                assert_eq!(data.node_id, "5");
                assert_eq!(data.node_type, "KSampler");
                assert_eq!(data.exception_message, "out of memory");
                assert_eq!(data.traceback.len(), 2);
            }
            other => panic!("Expected ExecutionError, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_error_without_optional_fields() {
        let json = r#"{"type":"execution_error","data":{"prompt_id":"abc","node_id":"5","exception_message":"boom","exception_type":"RuntimeError"}}"#;
        match parse_message(json).unwrap() {
            ComfyMessage::ExecutionError(data) => {
                assert!(data.node_type.is_empty());
                assert!(data.traceback.is_empty());
            }
            other => panic!("Expected ExecutionError, got {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_type_returns_error() {
        let json = r#"{"type":"unknown_thing","data":{}}"#;
        assert!(parse_message(json).is_err());
    }

    #[test]
    fn parse_invalid_json_returns_error() {
        assert!(parse_message("not json at all").is_err());
    }

    #[test]
    fn extract_sid_from_status() {
        let json = r#"{"type":"status","data":{"sid":"server-sid","status":{"exec_info":{"queue_remaining":0}}}}"#;
        assert_eq!(extract_sid(json).as_deref(), Some("server-sid"));
    }

    #[test]
    fn extract_sid_absent() {
        let json = r#"{"type":"execution_start","data":{"prompt_id":"abc"}}"#;
        assert!(extract_sid(json).is_none());
    }
}
