//! Per-job execution profiling.
//!
//! When profiling is enabled each runner feeds its prompt's session
//! events through a [`JobProfiler`], which tracks per-node wall time,
//! cached nodes, progress emissions, and overall phase durations.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use fanout_comfyui::events::SessionEvent;
use fanout_core::types::Timestamp;

/// How many of the slowest nodes the summary keeps.
const SLOWEST_NODE_COUNT: usize = 5;

/// Final state of one node in the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Running,
    Completed,
    Cached,
    Failed,
}

/// One progress emission from a node.
#[derive(Debug, Clone)]
pub struct ProgressSample {
    pub at: Timestamp,
    pub value: i32,
    pub max: i32,
}

/// Timing record for a single node.
#[derive(Debug, Clone)]
pub struct NodeProfile {
    pub node_id: String,
    pub status: NodeStatus,
    pub duration: Option<Duration>,
    pub progress_events: Vec<ProgressSample>,
    started_at: Option<Instant>,
}

impl NodeProfile {
    fn new(node_id: String, status: NodeStatus) -> Self {
        Self {
            node_id,
            status,
            duration: None,
            progress_events: Vec::new(),
            started_at: None,
        }
    }
}

/// Aggregate numbers over the whole prompt.
#[derive(Debug, Clone)]
pub struct ProfileSummary {
    pub total_nodes: usize,
    pub executed: usize,
    pub cached: usize,
    pub failed: usize,
    /// Up to five slowest nodes, slowest first.
    pub slowest: Vec<(String, Duration)>,
    pub nodes_with_progress: Vec<String>,
}

/// The finished profile attached to a completed job.
#[derive(Debug, Clone)]
pub struct JobProfile {
    pub nodes: Vec<NodeProfile>,
    pub summary: ProfileSummary,
    /// Time between enqueue and execution start.
    pub queue_time: Duration,
    /// Time between execution start and the last observed event.
    pub execution_time: Duration,
    pub total_duration: Duration,
}

/// Accumulates session events for one prompt into a [`JobProfile`].
///
/// The caller filters events by prompt id; the profiler only orders and
/// times them.
pub struct JobProfiler {
    execution_started_at: Option<Instant>,
    execution_ended_at: Option<Instant>,
    current_node: Option<String>,
    nodes: Vec<NodeProfile>,
    index: HashMap<String, usize>,
}

impl JobProfiler {
    pub fn new() -> Self {
        Self {
            execution_started_at: None,
            execution_ended_at: None,
            current_node: None,
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Feed one event for this profiler's prompt.
    pub fn observe(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::ExecutionStart { .. } => {
                self.execution_started_at = Some(Instant::now());
            }
            SessionEvent::ExecutionCached { nodes, .. } => {
                for node in nodes {
                    let entry = self.entry(node);
                    entry.status = NodeStatus::Cached;
                    entry.duration = Some(Duration::ZERO);
                }
            }
            SessionEvent::Executing { node, .. } => {
                self.complete_current(NodeStatus::Completed);
                match node {
                    Some(node) => {
                        let entry = self.entry(node);
                        entry.status = NodeStatus::Running;
                        entry.started_at = Some(Instant::now());
                        self.current_node = Some(node.clone());
                    }
                    None => {
                        self.execution_ended_at = Some(Instant::now());
                    }
                }
            }
            SessionEvent::Progress {
                node, value, max, ..
            } => {
                let target = node.clone().or_else(|| self.current_node.clone());
                if let Some(node) = target {
                    self.entry(&node).progress_events.push(ProgressSample {
                        at: chrono::Utc::now(),
                        value: *value,
                        max: *max,
                    });
                }
            }
            SessionEvent::ExecutionSuccess { .. } => {
                self.complete_current(NodeStatus::Completed);
                self.execution_ended_at.get_or_insert_with(Instant::now);
            }
            SessionEvent::ExecutionError(data) => {
                if self.current_node.as_deref() == Some(data.node_id.as_str()) {
                    self.complete_current(NodeStatus::Failed);
                } else {
                    self.entry(&data.node_id).status = NodeStatus::Failed;
                }
                self.execution_ended_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    /// Build the final profile. `queue_time` is the enqueue-to-start wait
    /// measured by the runner.
    pub fn finish(self, queue_time: Duration) -> JobProfile {
        let execution_time = match (self.execution_started_at, self.execution_ended_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };

        let executed = self
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Completed)
            .count();
        let cached = self
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Cached)
            .count();
        let failed = self
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Failed)
            .count();

        let mut slowest: Vec<(String, Duration)> = self
            .nodes
            .iter()
            .filter_map(|n| n.duration.map(|d| (n.node_id.clone(), d)))
            .collect();
        slowest.sort_by(|a, b| b.1.cmp(&a.1));
        slowest.truncate(SLOWEST_NODE_COUNT);

        let nodes_with_progress = self
            .nodes
            .iter()
            .filter(|n| !n.progress_events.is_empty())
            .map(|n| n.node_id.clone())
            .collect();

        let summary = ProfileSummary {
            total_nodes: self.nodes.len(),
            executed,
            cached,
            failed,
            slowest,
            nodes_with_progress,
        };

        JobProfile {
            queue_time,
            execution_time,
            total_duration: queue_time + execution_time,
            nodes: self.nodes,
            summary,
        }
    }

    // ---- private helpers ----

    fn entry(&mut self, node_id: &str) -> &mut NodeProfile {
        let i = match self.index.get(node_id) {
            Some(&i) => i,
            None => {
                self.nodes
                    .push(NodeProfile::new(node_id.to_string(), NodeStatus::Running));
                let i = self.nodes.len() - 1;
                self.index.insert(node_id.to_string(), i);
                i
            }
        };
        &mut self.nodes[i]
    }

    fn complete_current(&mut self, status: NodeStatus) {
        let Some(current) = self.current_node.take() else {
            return;
        };
        let entry = self.entry(&current);
        if entry.status == NodeStatus::Running {
            entry.status = status;
            entry.duration = entry.started_at.map(|s| s.elapsed());
        }
    }
}

impl Default for JobProfiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn executing(node: Option<&str>) -> SessionEvent {
        SessionEvent::Executing {
            prompt_id: "p1".to_string(),
            node: node.map(|n| n.to_string()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn times_nodes_in_sequence() {
        let mut profiler = JobProfiler::new();
        profiler.observe(&SessionEvent::ExecutionStart {
            prompt_id: "p1".to_string(),
        });

        profiler.observe(&executing(Some("3")));
        advance(Duration::from_secs(2)).await;
        profiler.observe(&executing(Some("9")));
        advance(Duration::from_secs(1)).await;
        profiler.observe(&executing(None));

        let profile = profiler.finish(Duration::from_secs(5));

        assert_eq!(profile.summary.total_nodes, 2);
        assert_eq!(profile.summary.executed, 2);
        assert_eq!(profile.nodes[0].node_id, "3");
        assert_eq!(profile.nodes[0].duration, Some(Duration::from_secs(2)));
        assert_eq!(profile.nodes[1].duration, Some(Duration::from_secs(1)));
        assert_eq!(profile.execution_time, Duration::from_secs(3));
        assert_eq!(profile.queue_time, Duration::from_secs(5));
        assert_eq!(profile.total_duration, Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn cached_nodes_have_zero_duration() {
        let mut profiler = JobProfiler::new();
        profiler.observe(&SessionEvent::ExecutionStart {
            prompt_id: "p1".to_string(),
        });
        profiler.observe(&SessionEvent::ExecutionCached {
            prompt_id: "p1".to_string(),
            nodes: vec!["1".to_string(), "2".to_string()],
        });
        profiler.observe(&executing(None));

        let profile = profiler.finish(Duration::ZERO);
        assert_eq!(profile.summary.cached, 2);
        assert!(profile
            .nodes
            .iter()
            .all(|n| n.duration == Some(Duration::ZERO)));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_events_are_recorded_per_node() {
        let mut profiler = JobProfiler::new();
        profiler.observe(&executing(Some("3")));
        for step in 1..=4 {
            profiler.observe(&SessionEvent::Progress {
                prompt_id: Some("p1".to_string()),
                node: None,
                value: step,
                max: 4,
            });
        }
        profiler.observe(&executing(None));

        let profile = profiler.finish(Duration::ZERO);
        assert_eq!(profile.nodes[0].progress_events.len(), 4);
        assert_eq!(profile.summary.nodes_with_progress, vec!["3".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_node_is_marked() {
        let mut profiler = JobProfiler::new();
        profiler.observe(&executing(Some("4")));
        advance(Duration::from_secs(1)).await;
        profiler.observe(&SessionEvent::ExecutionError(
            fanout_comfyui::messages::ExecutionErrorData {
                prompt_id: "p1".to_string(),
                node_id: "4".to_string(),
                node_type: String::new(),
                exception_message: "boom".to_string(),
                exception_type: "RuntimeError".to_string(),
                traceback: Vec::new(),
            },
        ));

        let profile = profiler.finish(Duration::ZERO);
        assert_eq!(profile.summary.failed, 1);
        assert_eq!(profile.nodes[0].status, NodeStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn slowest_keeps_top_five() {
        let mut profiler = JobProfiler::new();
        profiler.observe(&SessionEvent::ExecutionStart {
            prompt_id: "p1".to_string(),
        });
        for i in 0..7u64 {
            let node = i.to_string();
            profiler.observe(&executing(Some(node.as_str())));
            advance(Duration::from_secs(i + 1)).await;
        }
        profiler.observe(&executing(None));

        let profile = profiler.finish(Duration::ZERO);
        assert_eq!(profile.summary.slowest.len(), 5);
        assert_eq!(profile.summary.slowest[0].0, "6");
        assert_eq!(profile.summary.slowest[0].1, Duration::from_secs(7));
    }
}
