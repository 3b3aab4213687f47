//! The job model owned by the pool.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use fanout_core::types::{JobId, PromptId, SessionId, Timestamp};
use fanout_core::workflow::NormalizedWorkflow;

use crate::classify::FailureKind;
use crate::profiler::JobProfile;

/// Default attempt budget per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before a retry attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A file uploaded to the chosen session before dispatch. After the
/// upload the referenced node input is rewritten to the stored filename.
#[derive(Debug, Clone)]
pub struct JobAttachment {
    /// Node whose input receives the uploaded filename.
    pub node_id: String,
    /// Input name within that node (e.g. `image`).
    pub input_name: String,
    /// Filename to store the attachment under.
    pub filename: String,
    /// Raw file content.
    pub bytes: Vec<u8>,
    /// Optional server-side subfolder.
    pub subfolder: Option<String>,
}

/// Caller-facing job options. All fields have defaults.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Higher runs first. Default 0.
    pub priority: i32,
    /// Stable caller-supplied id; generated when absent.
    pub job_id: Option<JobId>,
    pub max_attempts: u32,
    /// Per-job retry delay, unless the pool configures a global backoff.
    pub retry_delay: Duration,
    /// When non-empty, only these sessions may run the job.
    pub preferred_client_ids: Vec<SessionId>,
    /// Sessions that must never run the job.
    pub exclude_client_ids: Vec<SessionId>,
    /// Checkpoints the session must have installed.
    pub required_checkpoints: Vec<String>,
    /// Opaque caller metadata, echoed on the job record.
    pub metadata: Option<serde_json::Value>,
    /// Node ids whose outputs are collected into the result.
    pub include_outputs: Vec<String>,
    /// Output node id to result key mapping.
    pub output_aliases: HashMap<String, String>,
    pub attachments: Vec<JobAttachment>,
    /// Per-job override of the execution-start timeout.
    pub execution_start_timeout: Option<Duration>,
    /// Per-job override of the node-execution timeout.
    pub node_execution_timeout: Option<Duration>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            job_id: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            preferred_client_ids: Vec::new(),
            exclude_client_ids: Vec::new(),
            required_checkpoints: Vec::new(),
            metadata: None,
            include_outputs: Vec::new(),
            output_aliases: HashMap::new(),
            attachments: Vec::new(),
            execution_start_timeout: None,
            node_execution_timeout: None,
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Completed, failed, and cancelled jobs emit no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Output payload of a completed job.
#[derive(Debug, Clone)]
pub struct JobResult {
    /// Output alias (or raw node id) to the node's output value.
    pub outputs: HashMap<String, serde_json::Value>,
    pub prompt_id: PromptId,
    /// The output node ids that were requested.
    pub nodes: Vec<String>,
    pub aliases: HashMap<String, String>,
    /// Seeds substituted for the `-1` sentinel, by node id.
    pub auto_seeds: HashMap<String, i64>,
}

impl JobResult {
    /// Flatten into a single JSON object: one key per output alias plus
    /// the `_promptId` / `_nodes` / `_aliases` / `_autoSeeds` bookkeeping
    /// keys callers of the reference wire shape expect.
    pub fn to_value(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.outputs {
            map.insert(key.clone(), value.clone());
        }
        map.insert("_promptId".to_string(), self.prompt_id.clone().into());
        map.insert(
            "_nodes".to_string(),
            serde_json::Value::from(self.nodes.clone()),
        );
        map.insert(
            "_aliases".to_string(),
            serde_json::to_value(&self.aliases).unwrap_or_default(),
        );
        map.insert(
            "_autoSeeds".to_string(),
            serde_json::to_value(&self.auto_seeds).unwrap_or_default(),
        );
        serde_json::Value::Object(map)
    }
}

/// One classified failure of a (job, session) pair.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub session_id: SessionId,
    pub kind: FailureKind,
    pub message: String,
    /// Whether the session is permanently excluded for this job.
    pub permanent: bool,
}

/// A scheduled workflow job. Owned and mutated only by the pool and the
/// runner for this job; read through cloned snapshots.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// The pool's private copy of the workflow graph.
    pub workflow: serde_json::Value,
    /// Value-insensitive structural hash; shared by structurally
    /// identical workflows.
    pub fingerprint: String,
    pub options: JobOptions,
    pub status: JobStatus,
    pub attempts: u32,
    pub assigned_session: Option<SessionId>,
    pub prompt_id: Option<PromptId>,
    pub result: Option<JobResult>,
    pub last_error: Option<String>,
    pub enqueued_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub auto_seeds: HashMap<String, i64>,
    /// Authoritative exclusion set: caller exclusions plus sessions
    /// permanently failed for this job.
    pub excluded: HashSet<SessionId>,
    pub failures: Vec<FailureRecord>,
    pub profile: Option<JobProfile>,
}

impl Job {
    /// Build a fresh queued job from a normalized workflow.
    pub fn new(id: JobId, workflow: NormalizedWorkflow, mut options: JobOptions) -> Self {
        // Builder-provided aliases seed the map; explicit options win.
        for (node, alias) in workflow.output_aliases {
            options.output_aliases.entry(node).or_insert(alias);
        }
        let excluded: HashSet<SessionId> = options.exclude_client_ids.iter().cloned().collect();

        Self {
            id,
            workflow: workflow.json,
            fingerprint: workflow.fingerprint,
            options,
            status: JobStatus::Queued,
            attempts: 0,
            assigned_session: None,
            prompt_id: None,
            result: None,
            last_error: None,
            enqueued_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            auto_seeds: HashMap::new(),
            excluded,
            failures: Vec::new(),
            profile: None,
        }
    }

    /// Result key for an output node: its alias when one exists, the raw
    /// node id otherwise.
    pub fn output_key(&self, node_id: &str) -> String {
        self.options
            .output_aliases
            .get(node_id)
            .cloned()
            .unwrap_or_else(|| node_id.to_string())
    }

    /// Whether every recorded failure was a workflow/client
    /// incompatibility.
    pub fn all_failures_incompatible(&self) -> bool {
        !self.failures.is_empty()
            && self
                .failures
                .iter()
                .all(|f| f.kind == FailureKind::WorkflowIncompatible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::workflow::{normalize, WorkflowInput};
    use serde_json::json;

    fn normalized() -> NormalizedWorkflow {
        normalize(WorkflowInput::Json(json!({
            "9": {"class_type": "SaveImage", "inputs": {"images": ["3", 0]}}
        })))
        .unwrap()
    }

    #[test]
    fn new_job_is_queued_with_caller_exclusions() {
        let job = Job::new(
            "j1".to_string(),
            normalized(),
            JobOptions {
                exclude_client_ids: vec!["s1".to_string()],
                ..Default::default()
            },
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.excluded.contains("s1"));
    }

    #[test]
    fn output_key_prefers_alias() {
        let job = Job::new(
            "j1".to_string(),
            normalized(),
            JobOptions {
                output_aliases: HashMap::from([("9".to_string(), "image".to_string())]),
                ..Default::default()
            },
        );
        assert_eq!(job.output_key("9"), "image");
        assert_eq!(job.output_key("7"), "7");
    }

    #[test]
    fn result_to_value_carries_bookkeeping_keys() {
        let result = JobResult {
            outputs: HashMap::from([("image".to_string(), json!({"images": []}))]),
            prompt_id: "p1".to_string(),
            nodes: vec!["9".to_string()],
            aliases: HashMap::from([("9".to_string(), "image".to_string())]),
            auto_seeds: HashMap::from([("3".to_string(), 77)]),
        };
        let value = result.to_value();
        assert_eq!(value["_promptId"], "p1");
        assert_eq!(value["_nodes"], json!(["9"]));
        assert_eq!(value["_aliases"]["9"], "image");
        assert_eq!(value["_autoSeeds"]["3"], 77);
        assert!(value["image"].is_object());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
