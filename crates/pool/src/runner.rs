//! Per-job attempt driver.
//!
//! One runner per in-flight job: uploads attachments, rewrites auto
//! seeds, submits the prompt, supervises the attempt with the
//! execution-start and node-execution timeouts, collects outputs, and on
//! failure either re-enqueues the job or terminates it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use fanout_comfyui::api::ApiError;
use fanout_comfyui::events::SessionEvent;
use fanout_comfyui::transport::{SessionTransport, SubmitPosition, UploadOptions};
use fanout_core::types::{JobId, PromptId};
use fanout_core::workflow::rewrite_auto_seeds;

use crate::classify::{classify_enqueue_error, classify_execution_error, FailureKind};
use crate::events::PoolEvent;
use crate::job::{FailureRecord, Job, JobOptions, JobResult, JobStatus};
use crate::manager::{ClientManager, Lease};
use crate::profiler::JobProfiler;
use crate::queue::{QueueAdapter, Reservation};

/// How long a cancelled runner waits for the server to acknowledge the
/// interrupt before resolving cancelled anyway.
const CANCEL_ACK_WAIT: Duration = Duration::from_secs(1);

/// Shared handles a runner needs from the pool.
pub(crate) struct RunnerContext {
    pub jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    pub queue: Arc<dyn QueueAdapter>,
    pub manager: Arc<ClientManager>,
    pub event_tx: broadcast::Sender<PoolEvent>,
    pub dispatch_nudge: Arc<Notify>,
    pub execution_start_timeout: Duration,
    pub node_execution_timeout: Duration,
    pub retry_backoff: Option<Duration>,
    pub enable_profiling: bool,
}

enum AttemptOutcome {
    Success,
    Failed { kind: FailureKind, message: String },
    Cancelled,
}

/// Drive one attempt of one job to a terminal decision.
pub(crate) async fn run_job(
    ctx: RunnerContext,
    job_id: JobId,
    reservation: Reservation,
    lease: Lease,
    cancel: CancellationToken,
) {
    let session = lease.session();
    let session_id = lease.session_id().to_string();

    // Transition to running and snapshot everything the attempt needs.
    let (mut workflow, options, fingerprint, attempt, enqueued_at) = {
        let mut jobs = ctx.jobs.write().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            tracing::warn!(job_id = %job_id, "Reserved job vanished, discarding");
            let _ = ctx.queue.discard(&reservation).await;
            lease.release(false).await;
            return;
        };
        if job.status == JobStatus::Cancelled {
            // A cancel raced the reservation; the cancel path already
            // emitted the terminal event.
            let _ = ctx.queue.discard(&reservation).await;
            lease.release(false).await;
            return;
        }
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.assigned_session = Some(session_id.clone());
        job.started_at = Some(chrono::Utc::now());
        (
            job.workflow.clone(),
            job.options.clone(),
            job.fingerprint.clone(),
            job.attempts,
            job.enqueued_at,
        )
    };

    tracing::info!(
        job_id = %job_id,
        session_id = %session_id,
        attempt,
        "Job assigned to session",
    );
    let _ = ctx.event_tx.send(PoolEvent::JobAccepted {
        job_id: job_id.clone(),
        session_id: session_id.clone(),
    });

    // Subscribe before submit so no early event is missed.
    let mut rx = session.subscribe();

    // Upload attachments and point the referencing inputs at the stored
    // filenames.
    for attachment in &options.attachments {
        let upload = session
            .upload_asset(
                attachment.bytes.clone(),
                &attachment.filename,
                UploadOptions {
                    subfolder: attachment.subfolder.clone(),
                    overwrite: true,
                },
            )
            .await;
        match upload {
            Ok(uploaded) => {
                let stored = if uploaded.subfolder.is_empty() {
                    uploaded.name
                } else {
                    format!("{}/{}", uploaded.subfolder, uploaded.name)
                };
                if let Some(inputs) = workflow
                    .get_mut(&attachment.node_id)
                    .and_then(|n| n.get_mut("inputs"))
                    .and_then(|i| i.as_object_mut())
                {
                    inputs.insert(attachment.input_name.clone(), stored.into());
                } else {
                    tracing::warn!(
                        job_id = %job_id,
                        node_id = %attachment.node_id,
                        "Attachment references a missing node input",
                    );
                }
            }
            Err(e) => {
                fail_attempt(
                    &ctx,
                    &job_id,
                    &reservation,
                    &lease,
                    &session_id,
                    &fingerprint,
                    FailureKind::Transport,
                    format!("Attachment upload failed: {e}"),
                    attempt,
                    &cancel,
                )
                .await;
                return;
            }
        }
    }

    let auto_seeds = rewrite_auto_seeds(&mut workflow);

    if cancel.is_cancelled() {
        cancel_attempt(&ctx, &job_id, &reservation, &lease, None, &mut rx).await;
        return;
    }

    // The caller's output bookkeeping rides in extra_data.
    let extra_data = serde_json::json!({
        "output_nodes": options.include_outputs,
        "output_aliases": options.output_aliases,
    });

    let prompt_id: PromptId = match session
        .submit(workflow, Some(extra_data), SubmitPosition::Append)
        .await
    {
        Ok(response) => response.prompt_id,
        Err(ApiError::Enqueue(e)) => {
            let kind = classify_enqueue_error(&e);
            fail_attempt(
                &ctx,
                &job_id,
                &reservation,
                &lease,
                &session_id,
                &fingerprint,
                kind,
                e.to_string(),
                attempt,
                &cancel,
            )
            .await;
            return;
        }
        Err(e) => {
            fail_attempt(
                &ctx,
                &job_id,
                &reservation,
                &lease,
                &session_id,
                &fingerprint,
                FailureKind::Transport,
                format!("Prompt submission failed: {e}"),
                attempt,
                &cancel,
            )
            .await;
            return;
        }
    };

    {
        let mut jobs = ctx.jobs.write().await;
        if let Some(job) = jobs.get_mut(&job_id) {
            job.prompt_id = Some(prompt_id.clone());
            job.auto_seeds = auto_seeds.clone();
        }
    }

    // ---- attempt supervision ----

    let start_timeout = options
        .execution_start_timeout
        .unwrap_or(ctx.execution_start_timeout);
    let node_timeout = options
        .node_execution_timeout
        .unwrap_or(ctx.node_execution_timeout);

    let start_deadline = tokio::time::sleep(start_timeout);
    tokio::pin!(start_deadline);
    let node_deadline = tokio::time::sleep(node_timeout);
    tokio::pin!(node_deadline);

    let mut profiler = ctx.enable_profiling.then(JobProfiler::new);
    let mut outputs: HashMap<String, serde_json::Value> = HashMap::new();
    let mut started = false;
    let mut started_emitted = false;
    let mut current_node: Option<String> = None;

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break AttemptOutcome::Cancelled,

            _ = &mut start_deadline, if !started => {
                break AttemptOutcome::Failed {
                    kind: FailureKind::ExecutionStartTimeout,
                    message: format!(
                        "Execution failed to start within {} ms",
                        start_timeout.as_millis()
                    ),
                };
            }

            _ = &mut node_deadline, if started => {
                let node = current_node.as_deref().unwrap_or("unknown");
                break AttemptOutcome::Failed {
                    kind: FailureKind::NodeExecutionTimeout,
                    message: format!(
                        "Node {node} made no progress within {} ms",
                        node_timeout.as_millis()
                    ),
                };
            }

            event = rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(job_id = %job_id, skipped, "Runner lagged on session events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break AttemptOutcome::Failed {
                            kind: FailureKind::Transport,
                            message: "Session event stream closed".to_string(),
                        };
                    }
                };

                match &event {
                    SessionEvent::ExecutionStart { prompt_id: pid } if *pid == prompt_id => {
                        started = true;
                        node_deadline.as_mut().reset(Instant::now() + node_timeout);
                        if let Some(p) = profiler.as_mut() {
                            p.observe(&event);
                        }
                        if !started_emitted {
                            started_emitted = true;
                            let _ = ctx.event_tx.send(PoolEvent::JobStarted {
                                job_id: job_id.clone(),
                                session_id: session_id.clone(),
                                prompt_id: prompt_id.clone(),
                            });
                        }
                    }
                    SessionEvent::ExecutionCached { prompt_id: pid, .. } if *pid == prompt_id => {
                        started = true;
                        node_deadline.as_mut().reset(Instant::now() + node_timeout);
                        if let Some(p) = profiler.as_mut() {
                            p.observe(&event);
                        }
                    }
                    SessionEvent::Executing { prompt_id: pid, node } if *pid == prompt_id => {
                        if let Some(p) = profiler.as_mut() {
                            p.observe(&event);
                        }
                        match node {
                            Some(node) => {
                                started = true;
                                current_node = Some(node.clone());
                                node_deadline.as_mut().reset(Instant::now() + node_timeout);
                                if !started_emitted {
                                    started_emitted = true;
                                    let _ = ctx.event_tx.send(PoolEvent::JobStarted {
                                        job_id: job_id.clone(),
                                        session_id: session_id.clone(),
                                        prompt_id: prompt_id.clone(),
                                    });
                                }
                            }
                            // A null node marks prompt completion.
                            None => break AttemptOutcome::Success,
                        }
                    }
                    SessionEvent::Progress { prompt_id: pid, node, value, max } => {
                        // Early progress frames may predate prompt-id
                        // discovery; attribute them via the most recent
                        // executing-node hint.
                        let ours = pid.as_deref() == Some(prompt_id.as_str())
                            || (pid.is_none() && started);
                        if ours {
                            node_deadline.as_mut().reset(Instant::now() + node_timeout);
                            if let Some(p) = profiler.as_mut() {
                                p.observe(&event);
                            }
                            let _ = ctx.event_tx.send(PoolEvent::JobProgress {
                                job_id: job_id.clone(),
                                node: node.clone().or_else(|| current_node.clone()),
                                value: *value,
                                max: *max,
                            });
                        }
                    }
                    SessionEvent::Executed { prompt_id: pid, node, output } if *pid == prompt_id => {
                        node_deadline.as_mut().reset(Instant::now() + node_timeout);
                        let key = options
                            .output_aliases
                            .get(node)
                            .cloned()
                            .unwrap_or_else(|| node.clone());
                        outputs.insert(key, output.clone());
                        let _ = ctx.event_tx.send(PoolEvent::JobOutput {
                            job_id: job_id.clone(),
                            node: node.clone(),
                            output: output.clone(),
                        });
                    }
                    SessionEvent::ExecutionSuccess { prompt_id: pid } if *pid == prompt_id => {
                        if let Some(p) = profiler.as_mut() {
                            p.observe(&event);
                        }
                        break AttemptOutcome::Success;
                    }
                    SessionEvent::ExecutionError(data) if data.prompt_id == prompt_id => {
                        if let Some(p) = profiler.as_mut() {
                            p.observe(&event);
                        }
                        break AttemptOutcome::Failed {
                            kind: classify_execution_error(data),
                            message: format!(
                                "{}: {}",
                                data.exception_type, data.exception_message
                            ),
                        };
                    }
                    SessionEvent::Preview { mime, image } if started => {
                        let _ = ctx.event_tx.send(PoolEvent::JobPreview {
                            job_id: job_id.clone(),
                            mime: mime.clone(),
                            image: image.clone(),
                        });
                    }
                    SessionEvent::PreviewMeta { metadata, mime, image } if started => {
                        let _ = ctx.event_tx.send(PoolEvent::JobPreviewMeta {
                            job_id: job_id.clone(),
                            metadata: metadata.clone(),
                            mime: mime.clone(),
                            image: image.clone(),
                        });
                    }
                    SessionEvent::ReconnectionFailed => {
                        break AttemptOutcome::Failed {
                            kind: FailureKind::Transport,
                            message: "Session reconnect exhausted".to_string(),
                        };
                    }
                    // A plain disconnect is recovered by the session's
                    // own reconnect; the node timeout catches the stall
                    // if it is not.
                    _ => {}
                }
            }
        }
    };

    match outcome {
        AttemptOutcome::Success => {
            complete_attempt(
                &ctx,
                &job_id,
                &reservation,
                &lease,
                &prompt_id,
                &options,
                outputs,
                auto_seeds,
                profiler,
                enqueued_at,
            )
            .await;
        }
        AttemptOutcome::Failed { kind, message } => {
            fail_attempt(
                &ctx,
                &job_id,
                &reservation,
                &lease,
                &session_id,
                &fingerprint,
                kind,
                message,
                attempt,
                &cancel,
            )
            .await;
        }
        AttemptOutcome::Cancelled => {
            cancel_attempt(&ctx, &job_id, &reservation, &lease, Some(&prompt_id), &mut rx).await;
        }
    }
}

/// Finalize a successful attempt.
#[allow(clippy::too_many_arguments)]
async fn complete_attempt(
    ctx: &RunnerContext,
    job_id: &str,
    reservation: &Reservation,
    lease: &Lease,
    prompt_id: &str,
    options: &JobOptions,
    mut outputs: HashMap<String, serde_json::Value>,
    auto_seeds: HashMap<String, i64>,
    profiler: Option<JobProfiler>,
    enqueued_at: fanout_core::types::Timestamp,
) {
    // Backfill outputs the live stream never delivered.
    let missing: Vec<String> = options
        .include_outputs
        .iter()
        .filter(|node| {
            let key = options
                .output_aliases
                .get(*node)
                .cloned()
                .unwrap_or_else(|| (*node).clone());
            !outputs.contains_key(&key)
        })
        .cloned()
        .collect();
    if !missing.is_empty() {
        match lease.session().history(prompt_id).await {
            Ok(history) => {
                let recorded = history.get(prompt_id).and_then(|h| h.get("outputs"));
                for node in missing {
                    if let Some(output) = recorded.and_then(|o| o.get(node.as_str())) {
                        let key = options
                            .output_aliases
                            .get(&node)
                            .cloned()
                            .unwrap_or_else(|| node.clone());
                        outputs.insert(key, output.clone());
                    }
                }
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Output backfill from history failed");
            }
        }
    }

    let result = JobResult {
        outputs,
        prompt_id: prompt_id.to_string(),
        nodes: options.include_outputs.clone(),
        aliases: options.output_aliases.clone(),
        auto_seeds,
    };

    {
        let mut jobs = ctx.jobs.write().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.status = JobStatus::Completed;
            job.completed_at = Some(chrono::Utc::now());
            job.result = Some(result.clone());
            job.failures.clear();
            job.profile = profiler.map(|p| {
                let queue_time = job
                    .started_at
                    .map(|started| (started - enqueued_at).to_std().unwrap_or_default())
                    .unwrap_or_default();
                p.finish(queue_time)
            });
        }
    }

    if let Err(e) = ctx.queue.commit(reservation).await {
        tracing::error!(job_id, error = %e, "Reservation commit failed");
    }
    lease.release(true).await;

    tracing::info!(job_id, prompt_id, "Job completed");
    let _ = ctx.event_tx.send(PoolEvent::JobCompleted {
        job_id: job_id.to_string(),
        result,
    });
    ctx.dispatch_nudge.notify_one();
}

/// Record a failed attempt and either re-enqueue or terminate.
#[allow(clippy::too_many_arguments)]
async fn fail_attempt(
    ctx: &RunnerContext,
    job_id: &str,
    reservation: &Reservation,
    lease: &Lease,
    session_id: &str,
    fingerprint: &str,
    kind: FailureKind,
    message: String,
    attempt: u32,
    cancel: &CancellationToken,
) {
    tracing::warn!(
        job_id,
        session_id,
        attempt,
        ?kind,
        error = %message,
        "Job attempt failed",
    );

    let (max_attempts, retry_delay) = {
        let mut jobs = ctx.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            let _ = ctx.queue.discard(reservation).await;
            lease.release(false).await;
            return;
        };
        job.last_error = Some(message.clone());
        job.failures.push(FailureRecord {
            session_id: session_id.to_string(),
            kind,
            message: message.clone(),
            permanent: kind.excludes_session(),
        });
        if kind.excludes_session() {
            job.excluded.insert(session_id.to_string());
        }
        (job.options.max_attempts, job.options.retry_delay)
    };

    ctx.manager
        .record_failure(session_id, fingerprint, kind, &message)
        .await;
    lease.release(false).await;

    let retry_possible = kind.retryable() && attempt < max_attempts;
    let has_path = if retry_possible {
        let snapshot = ctx.jobs.read().await.get(job_id).cloned();
        match snapshot {
            Some(job) => ctx.manager.has_viable_session(&job).await,
            None => false,
        }
    } else {
        false
    };

    if retry_possible && has_path {
        let _ = ctx.event_tx.send(PoolEvent::JobFailed {
            job_id: job_id.to_string(),
            error: message.clone(),
            will_retry: true,
        });

        let delay = ctx.retry_backoff.unwrap_or(retry_delay);
        let _ = ctx.event_tx.send(PoolEvent::JobRetrying {
            job_id: job_id.to_string(),
            delay,
            attempt,
        });

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ctx.queue.discard(reservation).await;
                finalize_status(ctx, job_id, JobStatus::Cancelled, None).await;
                let _ = ctx.event_tx.send(PoolEvent::JobCancelled {
                    job_id: job_id.to_string(),
                });
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        if let Err(e) = ctx.queue.retry(reservation).await {
            tracing::error!(job_id, error = %e, "Retry re-enqueue failed");
            finalize_status(ctx, job_id, JobStatus::Failed, Some(message)).await;
            return;
        }
        {
            let mut jobs = ctx.jobs.write().await;
            if let Some(job) = jobs.get_mut(job_id) {
                job.status = JobStatus::Queued;
                job.assigned_session = None;
            }
        }
        let _ = ctx.event_tx.send(PoolEvent::JobQueued {
            job_id: job_id.to_string(),
        });
        ctx.dispatch_nudge.notify_one();
        return;
    }

    // Terminal failure. When every recorded failure was an
    // incompatibility, synthesize the aggregate error.
    let error = {
        let jobs = ctx.jobs.read().await;
        match jobs.get(job_id) {
            Some(job) if job.all_failures_incompatible() => {
                let reasons: Vec<String> = job
                    .failures
                    .iter()
                    .map(|f| format!("{}: {}", f.session_id, f.message))
                    .collect();
                format!(
                    "Workflow not supported by any available session ({})",
                    reasons.join("; ")
                )
            }
            _ => message,
        }
    };

    if let Err(e) = ctx.queue.discard(reservation).await {
        tracing::error!(job_id, error = %e, "Reservation discard failed");
    }
    finalize_status(ctx, job_id, JobStatus::Failed, Some(error.clone())).await;
    let _ = ctx.event_tx.send(PoolEvent::JobFailed {
        job_id: job_id.to_string(),
        error,
        will_retry: false,
    });
    ctx.dispatch_nudge.notify_one();
}

/// Resolve a caller-initiated cancellation of a running attempt.
///
/// Best-effort: the server is asked to interrupt, the runner waits a
/// bounded moment for a terminal acknowledgement, then resolves
/// cancelled regardless.
async fn cancel_attempt(
    ctx: &RunnerContext,
    job_id: &str,
    reservation: &Reservation,
    lease: &Lease,
    prompt_id: Option<&str>,
    rx: &mut broadcast::Receiver<SessionEvent>,
) {
    if let Some(prompt_id) = prompt_id {
        if let Err(e) = lease.session().interrupt(prompt_id).await {
            tracing::warn!(job_id, error = %e, "Interrupt request failed");
        }

        let deadline = Instant::now() + CANCEL_ACK_WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(SessionEvent::ExecutionError(data))) if data.prompt_id == prompt_id => break,
                Ok(Ok(SessionEvent::ExecutionSuccess { prompt_id: pid })) if pid == prompt_id => {
                    break
                }
                Ok(Ok(_)) => continue,
                Ok(Err(_)) | Err(_) => break,
            }
        }
    }

    if let Err(e) = ctx.queue.discard(reservation).await {
        tracing::error!(job_id, error = %e, "Reservation discard failed");
    }
    lease.release(false).await;
    finalize_status(ctx, job_id, JobStatus::Cancelled, None).await;

    tracing::info!(job_id, "Job cancelled");
    let _ = ctx.event_tx.send(PoolEvent::JobCancelled {
        job_id: job_id.to_string(),
    });
    ctx.dispatch_nudge.notify_one();
}

async fn finalize_status(
    ctx: &RunnerContext,
    job_id: &str,
    status: JobStatus,
    error: Option<String>,
) {
    let mut jobs = ctx.jobs.write().await;
    if let Some(job) = jobs.get_mut(job_id) {
        job.status = status;
        job.completed_at = Some(chrono::Utc::now());
        if let Some(error) = error {
            job.last_error = Some(error);
        }
    }
}
