//! Identifier and timestamp aliases shared across the workspace.

/// Pool-assigned (or caller-supplied) job identifier.
pub type JobId = String;

/// Locally assigned client id of a session (UUID v4 string).
pub type SessionId = String;

/// Server-assigned id for an accepted workflow submission. Opaque.
pub type PromptId = String;

/// All wall-clock timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh UUID v4 identifier string.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
