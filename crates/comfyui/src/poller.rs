//! HTTP polling fallback for sessions whose event channel never opened.
//!
//! Polls the lightweight status probe and synthesizes `status` events so
//! the manager still sees queue depth, while periodically retrying the
//! event channel. Returns the re-established channel when one comes up.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::api::ComfyApi;
use crate::events::SessionEvent;

/// Interval between status polls.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Retry the event channel every this many polls (30 s at the default
/// poll interval).
pub(crate) const CHANNEL_RETRY_POLLS: u32 = 15;

/// Poll until the event channel can be re-established or `cancel` fires.
pub(crate) async fn polling_fallback<F, Fut, T, E>(
    api: &ComfyApi,
    event_tx: &broadcast::Sender<SessionEvent>,
    mut connect: F,
    cancel: &CancellationToken,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    tracing::warn!(
        url = api.base_url(),
        "Event channel unavailable, falling back to status polling",
    );

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut polls = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = ticker.tick() => {}
        }

        match api.prompt_status().await {
            Ok(status) => {
                let _ = event_tx.send(SessionEvent::Status {
                    queue_remaining: status.exec_info.queue_remaining,
                });
            }
            Err(e) => {
                tracing::debug!(error = %e, "Status poll failed");
            }
        }

        polls += 1;
        if polls % CHANNEL_RETRY_POLLS == 0 {
            match connect().await {
                Ok(stream) => {
                    tracing::info!(url = api.base_url(), "Event channel re-established, stopping polling fallback");
                    return Some(stream);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Event channel still unavailable");
                }
            }
        }
    }
}
