//! Registry of sessions plus the policy for which session may run a job.
//!
//! The manager mirrors online state from each session's event stream,
//! enforces the post-reconnect grace window, caches checkpoint
//! inventories with a TTL, runs the periodic health ping, and hands out
//! [`Lease`]s. Only the manager mutates the `busy` / `online` flags;
//! claim plus busy-set is atomic with respect to other claims.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use fanout_comfyui::events::SessionEvent;
use fanout_comfyui::transport::{ConnectionState, SessionTransport};
use fanout_core::types::{SessionId, Timestamp};

use crate::classify::FailureKind;
use crate::events::PoolEvent;
use crate::job::Job;
use crate::strategy::FailoverStrategy;

/// After a reconnect the session is considered warming up for this long;
/// claims reject until it passes.
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(10);

/// How long a fetched checkpoint inventory stays valid.
pub const DEFAULT_CHECKPOINT_TTL: Duration = Duration::from_secs(300);

struct CheckpointCache {
    fetched_at: Instant,
    names: Vec<String>,
}

/// Per-session bookkeeping.
struct ManagedSession {
    session: Arc<dyn SessionTransport>,
    /// Registration order; ties between equals resolve by it.
    seq: u64,
    online: bool,
    busy: bool,
    last_seen: Option<Timestamp>,
    last_error: Option<String>,
    last_disconnect: Option<Timestamp>,
    /// Claims reject before this instant.
    reconnect_stable_at: Option<Instant>,
    checkpoints: Option<CheckpointCache>,
    mirror_task: tokio::task::JoinHandle<()>,
}

/// Read-only view of a managed record.
#[derive(Debug, Clone)]
pub struct ManagedSnapshot {
    pub session_id: SessionId,
    pub url: String,
    pub online: bool,
    pub busy: bool,
    pub last_seen: Option<Timestamp>,
    pub last_error: Option<String>,
    pub last_disconnect: Option<Timestamp>,
    pub reconnect_stable_at: Option<Instant>,
}

/// Whether a record can be offered for a job right now, ignoring the
/// strategy and checkpoint constraints (those need shared state and
/// `await` respectively and are applied by the caller).
pub(crate) fn eligible(snapshot: &ManagedSnapshot, job: &Job, now: Instant) -> bool {
    snapshot.online
        && !snapshot.busy
        && snapshot
            .reconnect_stable_at
            .map(|stable_at| now >= stable_at)
            .unwrap_or(true)
        && !job.excluded.contains(&snapshot.session_id)
        && (job.options.preferred_client_ids.is_empty()
            || job
                .options
                .preferred_client_ids
                .contains(&snapshot.session_id))
}

type SessionMap = Arc<RwLock<HashMap<SessionId, ManagedSession>>>;

/// Transient right to submit exactly one job to one session.
///
/// Dropping without [`release`](Lease::release) leaks the busy flag;
/// runners always release, with `success = false` on every failure path.
pub struct Lease {
    session: Arc<dyn SessionTransport>,
    session_id: SessionId,
    fingerprint: String,
    sessions: SessionMap,
    strategy: Arc<dyn FailoverStrategy>,
    event_tx: broadcast::Sender<PoolEvent>,
    dispatch_nudge: Arc<Notify>,
    released: AtomicBool,
}

impl Lease {
    /// The leased session.
    pub fn session(&self) -> Arc<dyn SessionTransport> {
        Arc::clone(&self.session)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Clear the busy flag. On success, the strategy records the
    /// (session, fingerprint) success and a previously blocked workflow
    /// may unblock. Idempotent.
    pub async fn release(&self, success: bool) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let online = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&self.session_id) {
                Some(record) => {
                    record.busy = false;
                    record.last_seen = Some(chrono::Utc::now());
                    record.online
                }
                None => false,
            }
        };

        if success && self.strategy.record_success(&self.session_id, &self.fingerprint) {
            let _ = self.event_tx.send(PoolEvent::ClientUnblockedWorkflow {
                session_id: self.session_id.clone(),
                fingerprint: self.fingerprint.clone(),
            });
        }

        let _ = self.event_tx.send(PoolEvent::ClientState {
            session_id: self.session_id.clone(),
            online,
            busy: false,
        });
        self.dispatch_nudge.notify_one();
    }
}

/// Registry of sessions and lease policy.
pub struct ClientManager {
    sessions: SessionMap,
    strategy: Arc<dyn FailoverStrategy>,
    event_tx: broadcast::Sender<PoolEvent>,
    dispatch_nudge: Arc<Notify>,
    grace: Duration,
    checkpoint_ttl: Duration,
    cancel: CancellationToken,
    next_seq: AtomicU64,
    health_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl ClientManager {
    /// Build a manager and start the health ping timer
    /// (`health_interval` of zero disables it).
    pub fn new(
        strategy: Arc<dyn FailoverStrategy>,
        event_tx: broadcast::Sender<PoolEvent>,
        dispatch_nudge: Arc<Notify>,
        health_interval: Duration,
    ) -> Self {
        let manager = Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            strategy,
            event_tx,
            dispatch_nudge,
            grace: DEFAULT_RECONNECT_GRACE,
            checkpoint_ttl: DEFAULT_CHECKPOINT_TTL,
            cancel: CancellationToken::new(),
            next_seq: AtomicU64::new(0),
            health_task: std::sync::Mutex::new(None),
            destroyed: AtomicBool::new(false),
        };

        if !health_interval.is_zero() {
            let sessions = Arc::clone(&manager.sessions);
            let cancel = manager.cancel.clone();
            *manager.health_task.lock().unwrap() = Some(tokio::spawn(async move {
                run_health_pings(sessions, health_interval, cancel).await;
            }));
        }

        manager
    }

    /// Register a session and start mirroring its state.
    pub async fn add(&self, session: Arc<dyn SessionTransport>) -> SessionId {
        let session_id = session.id();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        // A session brought up before registration never emits its
        // `connected` event to us; seed from its current state.
        let online = matches!(session.state(), ConnectionState::Open);

        let mirror_task = tokio::spawn(mirror_session_state(
            Arc::clone(&self.sessions),
            session.subscribe(),
            session_id.clone(),
            self.event_tx.clone(),
            Arc::clone(&self.dispatch_nudge),
            self.grace,
            self.cancel.clone(),
        ));

        let record = ManagedSession {
            session,
            seq,
            online,
            busy: false,
            last_seen: online.then(chrono::Utc::now),
            last_error: None,
            last_disconnect: None,
            reconnect_stable_at: None,
            checkpoints: None,
            mirror_task,
        };
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), record);

        tracing::info!(session_id = %session_id, online, "Session registered");
        let _ = self.event_tx.send(PoolEvent::ClientState {
            session_id: session_id.clone(),
            online,
            busy: false,
        });
        if online {
            self.dispatch_nudge.notify_one();
        }
        session_id
    }

    /// Snapshot of all managed records, in registration order.
    pub async fn list(&self) -> Vec<ManagedSnapshot> {
        let sessions = self.sessions.read().await;
        let mut records: Vec<(&u64, ManagedSnapshot)> = sessions
            .values()
            .map(|record| (&record.seq, snapshot_of(record)))
            .collect();
        records.sort_by_key(|(seq, _)| **seq);
        records.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    /// Session ids that are online, not busy, and past their grace
    /// window, in registration order.
    pub async fn stable_sessions(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let sessions = self.sessions.read().await;
        let mut stable: Vec<(u64, SessionId)> = sessions
            .iter()
            .filter(|(_, record)| {
                record.online
                    && !record.busy
                    && record
                        .reconnect_stable_at
                        .map(|at| now >= at)
                        .unwrap_or(true)
            })
            .map(|(id, record)| (record.seq, id.clone()))
            .collect();
        stable.sort_by_key(|(seq, _)| *seq);
        stable.into_iter().map(|(_, id)| id).collect()
    }

    /// Filter `candidates` down to the sessions that may run `job`:
    /// excluded / preferred / strategy / required-checkpoint constraints.
    pub async fn eligible_among(&self, job: &Job, candidates: &[SessionId]) -> Vec<SessionId> {
        let mut result = Vec::new();
        for session_id in candidates {
            if job.excluded.contains(session_id) {
                continue;
            }
            if !job.options.preferred_client_ids.is_empty()
                && !job.options.preferred_client_ids.contains(session_id)
            {
                continue;
            }
            if self
                .strategy
                .should_skip_client(session_id, &job.fingerprint)
            {
                continue;
            }
            if !job.options.required_checkpoints.is_empty() {
                let have = self.checkpoints(session_id).await;
                if !job
                    .options
                    .required_checkpoints
                    .iter()
                    .all(|c| have.contains(c))
                {
                    continue;
                }
            }
            result.push(session_id.clone());
        }
        result
    }

    /// Select a session for a job: first eligible candidate in
    /// registration order. Marks it busy and returns the lease.
    pub async fn claim(&self, job: &Job) -> Option<Lease> {
        let now = Instant::now();
        let candidates: Vec<SessionId> = {
            let sessions = self.sessions.read().await;
            let mut eligible_records: Vec<(u64, SessionId)> = sessions
                .iter()
                .filter(|(_, record)| eligible(&snapshot_of(record), job, now))
                .filter(|(id, _)| !self.strategy.should_skip_client(id, &job.fingerprint))
                .map(|(id, record)| (record.seq, id.clone()))
                .collect();
            eligible_records.sort_by_key(|(seq, _)| *seq);
            eligible_records.into_iter().map(|(_, id)| id).collect()
        };

        for session_id in candidates {
            if !job.options.required_checkpoints.is_empty() {
                let have = self.checkpoints(&session_id).await;
                if !job
                    .options
                    .required_checkpoints
                    .iter()
                    .all(|c| have.contains(c))
                {
                    continue;
                }
            }
            if let Some(lease) = self.claim_specific(&session_id, job).await {
                return Some(lease);
            }
        }
        None
    }

    /// Mark a specific session busy for a job, if it is still stable.
    ///
    /// The dispatch pass plans assignments over a snapshot; this re-checks
    /// under the write lock so busy-set stays atomic.
    pub async fn claim_specific(&self, session_id: &str, job: &Job) -> Option<Lease> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let record = sessions.get_mut(session_id)?;
        let stable = record.online
            && !record.busy
            && record
                .reconnect_stable_at
                .map(|at| now >= at)
                .unwrap_or(true);
        if !stable {
            return None;
        }
        record.busy = true;
        let session = Arc::clone(&record.session);
        drop(sessions);

        let _ = self.event_tx.send(PoolEvent::ClientState {
            session_id: session_id.to_string(),
            online: true,
            busy: true,
        });

        Some(Lease {
            session,
            session_id: session_id.to_string(),
            fingerprint: job.fingerprint.clone(),
            sessions: Arc::clone(&self.sessions),
            strategy: Arc::clone(&self.strategy),
            event_tx: self.event_tx.clone(),
            dispatch_nudge: Arc::clone(&self.dispatch_nudge),
            released: AtomicBool::new(false),
        })
    }

    /// Whether any registered session could still run the job (not
    /// excluded, not strategy-blocked). Offline sessions count: they may
    /// come back before the retry.
    pub async fn has_viable_session(&self, job: &Job) -> bool {
        let sessions = self.sessions.read().await;
        sessions.keys().any(|id| {
            !job.excluded.contains(id) && !self.strategy.should_skip_client(id, &job.fingerprint)
        })
    }

    /// Record a failed attempt: clears busy, stamps the error, and feeds
    /// the strategy for kinds that implicate the (session, workflow)
    /// pairing.
    pub async fn record_failure(
        &self,
        session_id: &str,
        fingerprint: &str,
        kind: FailureKind,
        message: &str,
    ) {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(record) = sessions.get_mut(session_id) {
                record.busy = false;
                record.last_error = Some(message.to_string());
            }
        }

        if kind.blocks_session() && self.strategy.record_failure(session_id, fingerprint) {
            tracing::warn!(
                session_id,
                fingerprint,
                "Session blocked for workflow after repeated failures",
            );
            let _ = self.event_tx.send(PoolEvent::ClientBlockedWorkflow {
                session_id: session_id.to_string(),
                fingerprint: fingerprint.to_string(),
            });
        }
    }

    /// Checkpoint inventory for a session, cached with a TTL. Fetch
    /// errors yield the empty list without poisoning the cache.
    pub async fn checkpoints(&self, session_id: &str) -> Vec<String> {
        let session = {
            let sessions = self.sessions.read().await;
            let Some(record) = sessions.get(session_id) else {
                return Vec::new();
            };
            if let Some(cache) = &record.checkpoints {
                if cache.fetched_at.elapsed() < self.checkpoint_ttl {
                    return cache.names.clone();
                }
            }
            Arc::clone(&record.session)
        };

        match session.checkpoints().await {
            Ok(names) => {
                let mut sessions = self.sessions.write().await;
                if let Some(record) = sessions.get_mut(session_id) {
                    record.checkpoints = Some(CheckpointCache {
                        fetched_at: Instant::now(),
                        names: names.clone(),
                    });
                }
                names
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Checkpoint fetch failed");
                Vec::new()
            }
        }
    }

    /// All registered transports (for the pool's shutdown teardown).
    pub async fn transports(&self) -> Vec<Arc<dyn SessionTransport>> {
        self.sessions
            .read()
            .await
            .values()
            .map(|record| Arc::clone(&record.session))
            .collect()
    }

    /// Stop the health timer and detach the state mirrors. Does not
    /// destroy sessions; the pool owns that lifecycle choice.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Some(task) = self.health_task.lock().unwrap().take() {
            task.abort();
        }
        let sessions = self.sessions.read().await;
        for record in sessions.values() {
            record.mirror_task.abort();
        }
    }
}

fn snapshot_of(record: &ManagedSession) -> ManagedSnapshot {
    ManagedSnapshot {
        session_id: record.session.id(),
        url: record.session.url(),
        online: record.online,
        busy: record.busy,
        last_seen: record.last_seen,
        last_error: record.last_error.clone(),
        last_disconnect: record.last_disconnect,
        reconnect_stable_at: record.reconnect_stable_at,
    }
}

/// Mirror one session's lifecycle events into its managed record.
async fn mirror_session_state(
    sessions: SessionMap,
    mut rx: broadcast::Receiver<SessionEvent>,
    session_id: SessionId,
    event_tx: broadcast::Sender<PoolEvent>,
    dispatch_nudge: Arc<Notify>,
    grace: Duration,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };

        match event {
            Ok(SessionEvent::Connected) => {
                let busy = update_record(&sessions, &session_id, |record| {
                    record.online = true;
                    record.last_seen = Some(chrono::Utc::now());
                })
                .await;
                let _ = event_tx.send(PoolEvent::ClientState {
                    session_id: session_id.clone(),
                    online: true,
                    busy,
                });
                dispatch_nudge.notify_one();
            }
            Ok(SessionEvent::Reconnected) => {
                let busy = update_record(&sessions, &session_id, |record| {
                    record.online = true;
                    record.last_seen = Some(chrono::Utc::now());
                    record.reconnect_stable_at = Some(Instant::now() + grace);
                })
                .await;
                tracing::info!(
                    session_id = %session_id,
                    grace_secs = grace.as_secs(),
                    "Session reconnected, holding claims through grace window",
                );
                let _ = event_tx.send(PoolEvent::ClientState {
                    session_id: session_id.clone(),
                    online: true,
                    busy,
                });
                dispatch_nudge.notify_one();
            }
            Ok(SessionEvent::Disconnected) | Ok(SessionEvent::ReconnectionFailed) => {
                let busy = update_record(&sessions, &session_id, |record| {
                    record.online = false;
                    record.last_disconnect = Some(chrono::Utc::now());
                })
                .await;
                let _ = event_tx.send(PoolEvent::ClientState {
                    session_id: session_id.clone(),
                    online: false,
                    busy,
                });
            }
            Ok(SessionEvent::Status { .. }) => {
                update_record(&sessions, &session_id, |record| {
                    record.last_seen = Some(chrono::Utc::now());
                })
                .await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(session_id = %session_id, skipped, "State mirror lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn update_record<F>(sessions: &SessionMap, session_id: &str, mutate: F) -> bool
where
    F: FnOnce(&mut ManagedSession),
{
    let mut sessions = sessions.write().await;
    match sessions.get_mut(session_id) {
        Some(record) => {
            mutate(record);
            record.busy
        }
        None => false,
    }
}

/// Ping every online session (busy included, to keep channel activity
/// flowing under load). Failures are logged; offline marking is driven
/// by the session's own disconnect events, so a transient hiccup does
/// not remove capacity.
async fn run_health_pings(sessions: SessionMap, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let targets: Vec<(SessionId, Arc<dyn SessionTransport>)> = {
            let sessions = sessions.read().await;
            sessions
                .iter()
                .filter(|(_, record)| record.online)
                .map(|(id, record)| (id.clone(), Arc::clone(&record.session)))
                .collect()
        };

        for (session_id, session) in targets {
            match session.queue_status().await {
                Ok(_) => {
                    update_record(&sessions, &session_id, |record| {
                        record.last_seen = Some(chrono::Utc::now());
                    })
                    .await;
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Health ping failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use crate::strategy::SmartStrategy;
    use async_trait::async_trait;
    use fanout_comfyui::api::{ApiError, QueueSnapshot, SubmitResponse, UploadedAsset};
    use fanout_comfyui::transport::{SubmitPosition, UploadOptions};
    use fanout_core::workflow::{normalize, WorkflowInput};
    use serde_json::json;

    /// Minimal always-open transport for registry tests.
    struct StubTransport {
        id: String,
        event_tx: broadcast::Sender<SessionEvent>,
    }

    impl StubTransport {
        fn new(id: &str) -> Arc<Self> {
            let (event_tx, _) = broadcast::channel(16);
            Arc::new(Self {
                id: id.to_string(),
                event_tx,
            })
        }
    }

    #[async_trait]
    impl SessionTransport for StubTransport {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn url(&self) -> String {
            format!("http://{}:8188", self.id)
        }

        fn state(&self) -> ConnectionState {
            ConnectionState::Open
        }

        fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
            self.event_tx.subscribe()
        }

        async fn submit(
            &self,
            _prompt: serde_json::Value,
            _extra_data: Option<serde_json::Value>,
            _position: SubmitPosition,
        ) -> Result<SubmitResponse, ApiError> {
            Ok(SubmitResponse {
                prompt_id: "p".to_string(),
                number: 0,
                node_errors: serde_json::Value::Null,
            })
        }

        async fn interrupt(&self, _prompt_id: &str) -> Result<(), ApiError> {
            Ok(())
        }

        async fn upload_asset(
            &self,
            _bytes: Vec<u8>,
            filename: &str,
            _options: UploadOptions,
        ) -> Result<UploadedAsset, ApiError> {
            Ok(UploadedAsset {
                name: filename.to_string(),
                subfolder: String::new(),
                kind: "input".to_string(),
            })
        }

        async fn queue_status(&self) -> Result<QueueSnapshot, ApiError> {
            Ok(QueueSnapshot {
                queue_running: Vec::new(),
                queue_pending: Vec::new(),
            })
        }

        async fn checkpoints(&self) -> Result<Vec<String>, ApiError> {
            Ok(Vec::new())
        }

        async fn history(&self, _prompt_id: &str) -> Result<serde_json::Value, ApiError> {
            Ok(serde_json::Value::Null)
        }

        async fn destroy(&self) {}
    }

    fn test_manager() -> ClientManager {
        let (event_tx, _) = broadcast::channel(64);
        ClientManager::new(
            Arc::new(SmartStrategy::default()),
            event_tx,
            Arc::new(Notify::new()),
            Duration::ZERO,
        )
    }

    fn test_job(options: JobOptions) -> Job {
        let normalized = normalize(WorkflowInput::Json(json!({
            "1": {"class_type": "KSampler", "inputs": {"seed": 1}}
        })))
        .unwrap();
        Job::new("j1".to_string(), normalized, options)
    }

    fn snapshot(session_id: &str) -> ManagedSnapshot {
        ManagedSnapshot {
            session_id: session_id.to_string(),
            url: format!("http://{session_id}:8188"),
            online: true,
            busy: false,
            last_seen: None,
            last_error: None,
            last_disconnect: None,
            reconnect_stable_at: None,
        }
    }

    #[tokio::test]
    async fn offline_and_busy_records_are_ineligible() {
        let job = test_job(JobOptions::default());
        let now = Instant::now();

        let mut record = snapshot("s1");
        assert!(eligible(&record, &job, now));

        record.online = false;
        assert!(!eligible(&record, &job, now));

        record.online = true;
        record.busy = true;
        assert!(!eligible(&record, &job, now));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_window_blocks_claims_until_it_passes() {
        let job = test_job(JobOptions::default());
        let mut record = snapshot("s1");
        record.reconnect_stable_at = Some(Instant::now() + Duration::from_secs(10));

        assert!(!eligible(&record, &job, Instant::now()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(eligible(&record, &job, Instant::now()));
    }

    #[tokio::test]
    async fn excluded_and_preferred_lists_are_honored() {
        let now = Instant::now();

        let excluding = test_job(JobOptions {
            exclude_client_ids: vec!["s1".to_string()],
            ..Default::default()
        });
        assert!(!eligible(&snapshot("s1"), &excluding, now));
        assert!(eligible(&snapshot("s2"), &excluding, now));

        let preferring = test_job(JobOptions {
            preferred_client_ids: vec!["s2".to_string()],
            ..Default::default()
        });
        assert!(!eligible(&snapshot("s1"), &preferring, now));
        assert!(eligible(&snapshot("s2"), &preferring, now));
    }

    #[tokio::test]
    async fn claim_walks_registration_order_and_is_exclusive() {
        let manager = test_manager();
        manager.add(StubTransport::new("s1")).await;
        manager.add(StubTransport::new("s2")).await;

        let job = test_job(JobOptions::default());

        // First claim takes the first-registered session.
        let first = manager.claim(&job).await.expect("first claim");
        assert_eq!(first.session_id(), "s1");

        // While s1 is leased, claims fall through to s2; once both are
        // busy there is nothing left.
        let second = manager.claim(&job).await.expect("second claim");
        assert_eq!(second.session_id(), "s2");
        assert!(manager.claim(&job).await.is_none());

        // Release is idempotent and frees the session again.
        second.release(false).await;
        second.release(false).await;
        let third = manager.claim(&job).await.expect("claim after release");
        assert_eq!(third.session_id(), "s2");

        manager.destroy().await;
    }

    #[tokio::test]
    async fn claim_skips_excluded_sessions() {
        let manager = test_manager();
        manager.add(StubTransport::new("s1")).await;
        manager.add(StubTransport::new("s2")).await;

        let job = test_job(JobOptions {
            exclude_client_ids: vec!["s1".to_string()],
            ..Default::default()
        });
        let lease = manager.claim(&job).await.expect("claim");
        assert_eq!(lease.session_id(), "s2");

        manager.destroy().await;
    }

    #[tokio::test]
    async fn list_reports_registered_sessions_in_order() {
        let manager = test_manager();
        manager.add(StubTransport::new("s1")).await;
        manager.add(StubTransport::new("s2")).await;

        let records = manager.list().await;
        let ids: Vec<&str> = records.iter().map(|r| r.session_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert!(records.iter().all(|r| r.online && !r.busy));

        manager.destroy().await;
    }
}
