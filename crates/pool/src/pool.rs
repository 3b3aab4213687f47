//! The workflow pool: public API and dispatch loop.
//!
//! Callers enqueue workflows and subscribe to [`PoolEvent`]s; a single
//! dispatcher task, serialized by a processing guard and woken by a
//! notify plus a fallback tick, matches waiting jobs to stable sessions.
//! Jobs are ordered by priority, then selectivity (jobs with fewer
//! compatible sessions first, so broad jobs cannot starve narrow ones),
//! then FIFO.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use fanout_comfyui::transport::SessionTransport;
use fanout_core::error::CoreError;
use fanout_core::types::{new_id, JobId, SessionId};
use fanout_core::workflow::{normalize, WorkflowInput};

use crate::events::PoolEvent;
use crate::job::{Job, JobOptions, JobStatus};
use crate::manager::ClientManager;
use crate::queue::{InMemoryQueue, QueueAdapter, QueueError, QueuedJob};
use crate::runner::{run_job, RunnerContext};
use crate::strategy::{FailoverStrategy, SmartStrategy};

/// Default window for the first `execution_start` event.
pub const DEFAULT_EXECUTION_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Default window for per-node progress.
pub const DEFAULT_NODE_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default health ping period.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of waiting jobs examined per dispatch pass.
pub const DEFAULT_DISPATCH_PEEK_LIMIT: usize = 100;

/// Fallback dispatcher tick; also realizes grace-expiry and retry
/// wake-ups.
const DISPATCH_TICK: Duration = Duration::from_millis(500);

/// Broadcast capacity for pool events.
const POOL_EVENT_CAPACITY: usize = 1024;

/// How long shutdown waits for each task to wind down.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool construction options.
pub struct PoolConfig {
    /// Queue adapter; defaults to the in-memory queue.
    pub queue: Option<Arc<dyn QueueAdapter>>,
    /// Failover strategy; defaults to [`SmartStrategy`].
    pub strategy: Option<Arc<dyn FailoverStrategy>>,
    /// Global retry backoff; when unset, each job's `retry_delay`
    /// applies.
    pub retry_backoff: Option<Duration>,
    pub execution_start_timeout: Duration,
    pub node_execution_timeout: Duration,
    /// Zero disables health pings.
    pub health_check_interval: Duration,
    pub enable_profiling: bool,
    pub dispatch_peek_limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            queue: None,
            strategy: None,
            retry_backoff: None,
            execution_start_timeout: DEFAULT_EXECUTION_START_TIMEOUT,
            node_execution_timeout: DEFAULT_NODE_EXECUTION_TIMEOUT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            enable_profiling: false,
            dispatch_peek_limit: DEFAULT_DISPATCH_PEEK_LIMIT,
        }
    }
}

/// Errors from the pool's caller-facing API.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Pool is shut down")]
    ShutDown,

    #[error(transparent)]
    InvalidWorkflow(#[from] CoreError),

    #[error("A job with id {0} already exists")]
    DuplicateJob(JobId),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

// ---------------------------------------------------------------------------
// Dispatch planning
// ---------------------------------------------------------------------------

/// One waiting job considered by a dispatch pass.
#[derive(Debug, Clone)]
pub(crate) struct DispatchCandidate {
    pub job_id: JobId,
    pub priority: i32,
    /// Position in the peeked queue order (FIFO tiebreak).
    pub queue_index: usize,
    /// Stable sessions able to run this job, in registration order.
    pub eligible: Vec<SessionId>,
}

/// Sort candidates (priority desc, selectivity asc, FIFO) and greedily
/// assign each to its first still-free compatible session.
pub(crate) fn plan_assignments(
    mut candidates: Vec<DispatchCandidate>,
) -> Vec<(JobId, SessionId)> {
    candidates.retain(|c| !c.eligible.is_empty());
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.eligible.len().cmp(&b.eligible.len()))
            .then_with(|| a.queue_index.cmp(&b.queue_index))
    });

    let mut used: HashSet<SessionId> = HashSet::new();
    let mut plan = Vec::new();
    for candidate in candidates {
        if let Some(session_id) = candidate.eligible.iter().find(|s| !used.contains(*s)) {
            used.insert(session_id.clone());
            plan.push((candidate.job_id, session_id.clone()));
        }
    }
    plan
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

struct RunnerHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

struct PoolInner {
    queue: Arc<dyn QueueAdapter>,
    manager: Arc<ClientManager>,
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    event_tx: broadcast::Sender<PoolEvent>,
    dispatch_nudge: Arc<Notify>,
    processing: AtomicBool,
    trailing: AtomicBool,
    cancel: CancellationToken,
    runners: Mutex<HashMap<JobId, RunnerHandle>>,
    shut_down: AtomicBool,
    dispatcher_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    retry_backoff: Option<Duration>,
    execution_start_timeout: Duration,
    node_execution_timeout: Duration,
    enable_profiling: bool,
    dispatch_peek_limit: usize,
}

/// The scheduler. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct WorkflowPool {
    inner: Arc<PoolInner>,
}

impl WorkflowPool {
    /// Build the pool and start its dispatcher.
    ///
    /// Spawns background tasks, so it must be called within a Tokio
    /// runtime.
    pub fn new(config: PoolConfig) -> Self {
        let queue = config
            .queue
            .unwrap_or_else(|| Arc::new(InMemoryQueue::new()));
        let strategy = config
            .strategy
            .unwrap_or_else(|| Arc::new(SmartStrategy::default()));
        let (event_tx, _) = broadcast::channel(POOL_EVENT_CAPACITY);
        let dispatch_nudge = Arc::new(Notify::new());
        let manager = Arc::new(ClientManager::new(
            strategy,
            event_tx.clone(),
            Arc::clone(&dispatch_nudge),
            config.health_check_interval,
        ));

        let inner = Arc::new(PoolInner {
            queue,
            manager,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            dispatch_nudge,
            processing: AtomicBool::new(false),
            trailing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            runners: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
            dispatcher_task: std::sync::Mutex::new(None),
            retry_backoff: config.retry_backoff,
            execution_start_timeout: config.execution_start_timeout,
            node_execution_timeout: config.node_execution_timeout,
            enable_profiling: config.enable_profiling,
            dispatch_peek_limit: config.dispatch_peek_limit,
        });

        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&inner)));
        *inner.dispatcher_task.lock().unwrap() = Some(dispatcher);

        let _ = inner.event_tx.send(PoolEvent::Ready);
        WorkflowPool { inner }
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Register a session with the manager.
    pub async fn add_session(&self, session: Arc<dyn SessionTransport>) -> SessionId {
        let id = self.inner.manager.add(session).await;
        self.inner.dispatch_nudge.notify_one();
        id
    }

    /// Queue a workflow. Returns as soon as the job is queued; dispatch
    /// never blocks the caller.
    pub async fn enqueue(
        &self,
        workflow: impl Into<WorkflowInput>,
        options: JobOptions,
    ) -> Result<JobId, PoolError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }

        let normalized = normalize(workflow.into())?;
        let job_id = options.job_id.clone().unwrap_or_else(new_id);
        let priority = options.priority;

        {
            let mut jobs = self.inner.jobs.write().await;
            if jobs.contains_key(&job_id) {
                return Err(PoolError::DuplicateJob(job_id));
            }
            jobs.insert(job_id.clone(), Job::new(job_id.clone(), normalized, options));
        }

        self.inner
            .queue
            .enqueue(QueuedJob {
                job_id: job_id.clone(),
                priority,
            })
            .await?;

        tracing::info!(job_id = %job_id, priority, "Job queued");
        let _ = self.inner.event_tx.send(PoolEvent::JobQueued {
            job_id: job_id.clone(),
        });
        self.inner.dispatch_nudge.notify_one();
        Ok(job_id)
    }

    /// Read-only snapshot of a job.
    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.inner.jobs.read().await.get(job_id).cloned()
    }

    /// Cancel a job. Returns true iff the job was found and could be
    /// stopped: queued jobs leave the queue immediately, running jobs are
    /// interrupted best-effort.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let status = {
            let jobs = self.inner.jobs.read().await;
            jobs.get(job_id).map(|job| job.status)
        };
        let Some(status) = status else {
            return false;
        };

        match status {
            JobStatus::Queued => {
                if self.inner.queue.remove(job_id).await.unwrap_or(false) {
                    {
                        let mut jobs = self.inner.jobs.write().await;
                        if let Some(job) = jobs.get_mut(job_id) {
                            job.status = JobStatus::Cancelled;
                            job.completed_at = Some(chrono::Utc::now());
                        }
                    }
                    tracing::info!(job_id, "Queued job cancelled");
                    let _ = self.inner.event_tx.send(PoolEvent::JobCancelled {
                        job_id: job_id.to_string(),
                    });
                    return true;
                }
                // Dispatch already reserved the job; delegate to its
                // runner, or mark the record so the runner resolves the
                // reservation on startup.
                let token = {
                    let runners = self.inner.runners.lock().await;
                    runners.get(job_id).map(|handle| handle.cancel.clone())
                };
                match token {
                    Some(token) => {
                        token.cancel();
                        true
                    }
                    None => {
                        {
                            let mut jobs = self.inner.jobs.write().await;
                            if let Some(job) = jobs.get_mut(job_id) {
                                job.status = JobStatus::Cancelled;
                                job.completed_at = Some(chrono::Utc::now());
                            }
                        }
                        let _ = self.inner.event_tx.send(PoolEvent::JobCancelled {
                            job_id: job_id.to_string(),
                        });
                        true
                    }
                }
            }
            JobStatus::Running => {
                let token = {
                    let runners = self.inner.runners.lock().await;
                    runners.get(job_id).map(|handle| handle.cancel.clone())
                };
                match token {
                    Some(token) => {
                        token.cancel();
                        true
                    }
                    None => false,
                }
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }

    /// Job counts by status.
    pub async fn get_queue_stats(&self) -> QueueStats {
        let jobs = self.inner.jobs.read().await;
        let mut stats = QueueStats::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Queued => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Stop the dispatcher and health timer, cancel in-flight runners,
    /// and destroy every session. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down workflow pool");

        // Cancelling the root token also cancels every runner's child
        // token, which resolves their jobs as cancelled.
        self.inner.cancel.cancel();

        let dispatcher = self.inner.dispatcher_task.lock().unwrap().take();
        if let Some(task) = dispatcher {
            let _ = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, task).await;
        }

        let handles: Vec<tokio::task::JoinHandle<()>> = {
            let mut runners = self.inner.runners.lock().await;
            runners.drain().map(|(_, handle)| handle.task).collect()
        };
        for handle in handles {
            let _ = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, handle).await;
        }

        self.inner.manager.destroy().await;
        for transport in self.inner.manager.transports().await {
            transport.destroy().await;
        }

        tracing::info!("Workflow pool shut down");
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

async fn run_dispatcher(inner: Arc<PoolInner>) {
    tracing::info!(
        tick_ms = DISPATCH_TICK.as_millis() as u64,
        "Dispatcher started",
    );
    let mut ticker = tokio::time::interval(DISPATCH_TICK);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                tracing::info!("Dispatcher shutting down");
                break;
            }
            _ = inner.dispatch_nudge.notified() => {}
            _ = ticker.tick() => {}
        }
        dispatch_cycle(&inner).await;
    }
}

/// Run dispatch passes under the re-entrancy guard: a concurrent call
/// records a trailing pass and returns.
async fn dispatch_cycle(inner: &Arc<PoolInner>) {
    if inner
        .processing
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        inner.trailing.store(true, Ordering::SeqCst);
        return;
    }

    loop {
        if let Err(e) = dispatch_pass(inner).await {
            tracing::error!(error = %e, "Dispatch pass failed");
            let _ = inner.event_tx.send(PoolEvent::PoolError {
                message: e.to_string(),
            });
        }
        if !inner.trailing.swap(false, Ordering::SeqCst) {
            break;
        }
    }

    inner.processing.store(false, Ordering::SeqCst);
}

/// One dispatch pass over the waiting queue.
async fn dispatch_pass(inner: &Arc<PoolInner>) -> Result<(), QueueError> {
    let stable = inner.manager.stable_sessions().await;
    if stable.is_empty() {
        return Ok(());
    }

    let peeked = inner.queue.peek(inner.dispatch_peek_limit).await?;
    if peeked.is_empty() {
        return Ok(());
    }

    let mut candidates = Vec::new();
    for (queue_index, queued) in peeked.iter().enumerate() {
        let job = {
            let jobs = inner.jobs.read().await;
            jobs.get(&queued.job_id).cloned()
        };
        let Some(job) = job else { continue };
        if job.status != JobStatus::Queued {
            continue;
        }
        let eligible = inner.manager.eligible_among(&job, &stable).await;
        if eligible.is_empty() {
            continue;
        }
        candidates.push(DispatchCandidate {
            job_id: job.id.clone(),
            priority: job.options.priority,
            queue_index,
            eligible,
        });
    }

    for (job_id, session_id) in plan_assignments(candidates) {
        let Some(reservation) = inner.queue.reserve(&job_id).await? else {
            // A cancel or competing pass got there first.
            continue;
        };
        let job = {
            let jobs = inner.jobs.read().await;
            jobs.get(&job_id).cloned()
        };
        let Some(job) = job else {
            inner.queue.discard(&reservation).await?;
            continue;
        };
        let Some(lease) = inner.manager.claim_specific(&session_id, &job).await else {
            // The planned session became unstable between the snapshot
            // and now; put the job back for the next pass.
            inner.queue.retry(&reservation).await?;
            inner.trailing.store(true, Ordering::SeqCst);
            continue;
        };

        let ctx = RunnerContext {
            jobs: Arc::clone(&inner.jobs),
            queue: Arc::clone(&inner.queue),
            manager: Arc::clone(&inner.manager),
            event_tx: inner.event_tx.clone(),
            dispatch_nudge: Arc::clone(&inner.dispatch_nudge),
            execution_start_timeout: inner.execution_start_timeout,
            node_execution_timeout: inner.node_execution_timeout,
            retry_backoff: inner.retry_backoff,
            enable_profiling: inner.enable_profiling,
        };
        let runner_cancel = inner.cancel.child_token();

        // Hold the runners lock across the spawn so the runner's own
        // de-registration cannot precede the insert.
        let mut runners = inner.runners.lock().await;
        let inner_for_task = Arc::clone(inner);
        let task_job_id = job_id.clone();
        let task_cancel = runner_cancel.clone();
        let task = tokio::spawn(async move {
            run_job(ctx, task_job_id.clone(), reservation, lease, task_cancel).await;
            inner_for_task.runners.lock().await.remove(&task_job_id);
        });
        runners.insert(
            job_id,
            RunnerHandle {
                cancel: runner_cancel,
                task,
            },
        );
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(
        job_id: &str,
        priority: i32,
        queue_index: usize,
        eligible: &[&str],
    ) -> DispatchCandidate {
        DispatchCandidate {
            job_id: job_id.to_string(),
            priority,
            queue_index,
            eligible: eligible.iter().map(|s| s.to_string()).collect(),
        }
    }

    // -- plan_assignments -----------------------------------------------------

    #[test]
    fn narrow_jobs_are_assigned_before_broad_ones() {
        // J_b (queued first) can run anywhere; J_a only on s1. The
        // narrow job must get s1, pushing the broad one to s2.
        let plan = plan_assignments(vec![
            candidate("j_b", 0, 0, &["s1", "s2"]),
            candidate("j_a", 0, 1, &["s1"]),
        ]);
        assert_eq!(
            plan,
            vec![
                ("j_a".to_string(), "s1".to_string()),
                ("j_b".to_string(), "s2".to_string()),
            ]
        );
    }

    #[test]
    fn priority_dominates_selectivity() {
        let plan = plan_assignments(vec![
            candidate("narrow", 0, 0, &["s1"]),
            candidate("urgent", 5, 1, &["s1", "s2"]),
        ]);
        // The urgent job picks first even though it is broader.
        assert_eq!(plan[0].0, "urgent");
        assert_eq!(plan[0].1, "s1");
        assert_eq!(plan[1], ("narrow".to_string(), "s1".to_string()));
    }

    #[test]
    fn priority_dominates_but_both_run_when_sessions_suffice() {
        let plan = plan_assignments(vec![
            candidate("narrow", 0, 0, &["s2"]),
            candidate("urgent", 5, 1, &["s1", "s2"]),
        ]);
        assert_eq!(plan[0], ("urgent".to_string(), "s1".to_string()));
        assert_eq!(plan[1], ("narrow".to_string(), "s2".to_string()));
    }

    #[test]
    fn fifo_breaks_ties() {
        let plan = plan_assignments(vec![
            candidate("second", 0, 1, &["s1"]),
            candidate("first", 0, 0, &["s1"]),
        ]);
        assert_eq!(plan, vec![("first".to_string(), "s1".to_string())]);
    }

    #[test]
    fn jobs_without_sessions_are_dropped() {
        let plan = plan_assignments(vec![candidate("j", 0, 0, &[])]);
        assert!(plan.is_empty());
    }

    #[test]
    fn one_session_runs_at_most_one_job_per_pass() {
        let plan = plan_assignments(vec![
            candidate("a", 0, 0, &["s1"]),
            candidate("b", 0, 1, &["s1"]),
        ]);
        assert_eq!(plan.len(), 1);
    }

    // -- pool API -------------------------------------------------------------

    #[tokio::test]
    async fn enqueue_rejects_duplicates_and_invalid_workflows() {
        let pool = WorkflowPool::new(PoolConfig::default());

        let wf = json!({"1": {"class_type": "SaveImage", "inputs": {}}});
        let options = JobOptions {
            job_id: Some("fixed".to_string()),
            ..Default::default()
        };
        pool.enqueue(wf.clone(), options.clone()).await.unwrap();

        assert!(matches!(
            pool.enqueue(wf, options).await,
            Err(PoolError::DuplicateJob(_))
        ));
        assert!(matches!(
            pool.enqueue(json!([]), JobOptions::default()).await,
            Err(PoolError::InvalidWorkflow(_))
        ));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_an_error() {
        let pool = WorkflowPool::new(PoolConfig::default());
        pool.shutdown().await;
        // A second shutdown is a no-op.
        pool.shutdown().await;

        let wf = json!({"1": {"class_type": "SaveImage", "inputs": {}}});
        assert!(matches!(
            pool.enqueue(wf, JobOptions::default()).await,
            Err(PoolError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn stats_reflect_job_statuses() {
        let pool = WorkflowPool::new(PoolConfig::default());
        let wf = json!({"1": {"class_type": "SaveImage", "inputs": {}}});
        pool.enqueue(wf.clone(), JobOptions::default()).await.unwrap();
        pool.enqueue(wf, JobOptions::default()).await.unwrap();

        let stats = pool.get_queue_stats().await;
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.running, 0);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_of_queued_job_with_no_sessions() {
        let pool = WorkflowPool::new(PoolConfig::default());
        let wf = json!({"1": {"class_type": "SaveImage", "inputs": {}}});
        let job_id = pool.enqueue(wf, JobOptions::default()).await.unwrap();

        assert!(pool.cancel(&job_id).await);
        let job = pool.get_job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        // Terminal jobs cannot be cancelled again.
        assert!(!pool.cancel(&job_id).await);
        assert!(!pool.cancel("missing").await);

        pool.shutdown().await;
    }
}
