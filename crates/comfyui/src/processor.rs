//! Event channel read loop.
//!
//! Reads raw frames from the server, demultiplexes text messages and
//! binary frames into [`SessionEvent`]s, adopts server-assigned session
//! ids, and enforces the idle watchdog.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::api::ActivityTracker;
use crate::events::SessionEvent;
use crate::frames::{parse_binary_frame, BinaryFrame};
use crate::messages::{extract_sid, parse_message, ComfyMessage};

/// The concrete WebSocket stream type used by the session.
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// State shared between the session and its read loop.
pub(crate) struct ProcessorContext {
    /// Local client id; replaced when the server announces a `sid`.
    pub session_id: Arc<RwLock<String>>,
    pub event_tx: broadcast::Sender<SessionEvent>,
    pub activity: ActivityTracker,
    /// Idle threshold; the watchdog checks at half this period.
    pub ws_timeout: Duration,
    pub listen_terminal: bool,
    pub debug: bool,
}

/// Why the read loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessorExit {
    /// The stream closed or errored.
    ChannelClosed,
    /// Nothing was seen for longer than `ws_timeout`.
    IdleTimeout,
    /// The cancellation token fired.
    Cancelled,
}

/// Drive the channel until it closes, goes idle, or is cancelled.
pub(crate) async fn process_messages(
    ws_stream: &mut WsStream,
    ctx: &ProcessorContext,
    cancel: &CancellationToken,
) -> ProcessorExit {
    let mut watchdog = tokio::time::interval(ctx.ws_timeout / 2);
    // The first tick completes immediately; skip it.
    watchdog.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return ProcessorExit::Cancelled;
            }
            _ = watchdog.tick() => {
                if ctx.activity.idle_for() > ctx.ws_timeout {
                    tracing::warn!(
                        idle_ms = ctx.activity.idle_for().as_millis() as u64,
                        "Event channel idle past threshold, forcing reconnect",
                    );
                    return ProcessorExit::IdleTimeout;
                }
            }
            msg_result = ws_stream.next() => {
                let Some(msg_result) = msg_result else {
                    return ProcessorExit::ChannelClosed;
                };
                match msg_result {
                    Ok(Message::Text(text)) => {
                        ctx.activity.touch();
                        handle_text_message(&text, ctx);
                    }
                    Ok(Message::Binary(data)) => {
                        ctx.activity.touch();
                        handle_binary_message(&data, ctx);
                    }
                    Ok(Message::Ping(_) | Message::Pong(_)) => {
                        // Handled automatically by tungstenite; still
                        // counts as channel activity.
                        ctx.activity.touch();
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::info!(?frame, "Event channel closed by server");
                        return ProcessorExit::ChannelClosed;
                    }
                    Ok(Message::Frame(_)) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "Event channel receive error");
                        return ProcessorExit::ChannelClosed;
                    }
                }
            }
        }
    }
}

/// Parse one text frame and fan out the resulting event.
fn handle_text_message(text: &str, ctx: &ProcessorContext) {
    if ctx.debug {
        tracing::trace!(raw = %text, "Inbound text frame");
    }

    // The server may announce its own session id in any message.
    if let Some(sid) = extract_sid(text) {
        let mut id = ctx.session_id.write().unwrap();
        if *id != sid {
            tracing::info!(old = %id, new = %sid, "Adopting server-assigned session id");
            *id = sid;
        }
    }

    match parse_message(text) {
        Ok(msg) => {
            let _ = ctx.event_tx.send(message_to_event(msg));
        }
        Err(e) => {
            tracing::debug!(error = %e, raw = %text, "Ignoring unparseable message");
        }
    }
}

/// Decode one binary frame and fan out the resulting event.
fn handle_binary_message(data: &[u8], ctx: &ProcessorContext) {
    match parse_binary_frame(data) {
        Some(BinaryFrame::Preview { mime, image }) => {
            let _ = ctx.event_tx.send(SessionEvent::Preview { mime, image });
        }
        Some(BinaryFrame::PreviewMeta {
            metadata,
            mime,
            image,
        }) => {
            let _ = ctx.event_tx.send(SessionEvent::PreviewMeta {
                metadata,
                mime,
                image,
            });
        }
        Some(BinaryFrame::Text { channel, text }) => {
            if ctx.listen_terminal {
                let _ = ctx.event_tx.send(SessionEvent::Terminal { channel, text });
            }
        }
        None => {}
    }
}

/// Map a parsed wire message onto the session event stream.
pub(crate) fn message_to_event(msg: ComfyMessage) -> SessionEvent {
    match msg {
        ComfyMessage::Status(data) => SessionEvent::Status {
            queue_remaining: data.status.exec_info.queue_remaining,
        },
        ComfyMessage::ExecutionStart(data) => SessionEvent::ExecutionStart {
            prompt_id: data.prompt_id,
        },
        ComfyMessage::ExecutionCached(data) => SessionEvent::ExecutionCached {
            prompt_id: data.prompt_id,
            nodes: data.nodes,
        },
        ComfyMessage::Executing(data) => SessionEvent::Executing {
            prompt_id: data.prompt_id,
            node: data.node,
        },
        ComfyMessage::Progress(data) => SessionEvent::Progress {
            prompt_id: data.prompt_id,
            node: data.node,
            value: data.value,
            max: data.max,
        },
        ComfyMessage::Executed(data) => SessionEvent::Executed {
            prompt_id: data.prompt_id,
            node: data.node,
            output: data.output,
        },
        ComfyMessage::ExecutionSuccess(data) => SessionEvent::ExecutionSuccess {
            prompt_id: data.prompt_id,
        },
        ComfyMessage::ExecutionError(data) => SessionEvent::ExecutionError(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn status_message_becomes_status_event() {
        let msg =
            parse_message(r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":2}}}}"#)
                .unwrap();
        assert_matches!(
            message_to_event(msg),
            SessionEvent::Status { queue_remaining: 2 }
        );
    }

    #[test]
    fn executing_completion_marker_is_preserved() {
        let msg =
            parse_message(r#"{"type":"executing","data":{"node":null,"prompt_id":"p1"}}"#).unwrap();
        assert_matches!(
            message_to_event(msg),
            SessionEvent::Executing { prompt_id, node: None } if prompt_id == "p1"
        );
    }
}
