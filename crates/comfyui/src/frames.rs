//! Binary frame demultiplexing.
//!
//! Every binary frame on the event channel begins with a 4-byte big-endian
//! event kind:
//!
//! - kind `1`: legacy preview. Next 4 bytes are the image type
//!   (1 = JPEG, 2 = PNG), remainder is the image bytes.
//! - kind `2`: raw preview. Remainder is image bytes.
//! - kind `3`: text frame. Next 4 bytes are a big-endian channel id,
//!   remainder is UTF-8 text.
//! - kind `4`: preview with metadata. Next 4 bytes are a big-endian
//!   metadata length N, the following N bytes are UTF-8 JSON metadata,
//!   the remainder is image bytes whose MIME comes from the metadata's
//!   `image_type` field.
//!
//! Frames shorter than the prefix required for their kind are dropped with
//! a log. Unknown kinds are ignored.

/// Binary frame event kinds.
const KIND_PREVIEW_LEGACY: u32 = 1;
const KIND_PREVIEW_RAW: u32 = 2;
const KIND_TEXT: u32 = 3;
const KIND_PREVIEW_META: u32 = 4;

/// MIME used when a preview frame does not state one.
const DEFAULT_PREVIEW_MIME: &str = "image/jpeg";

/// A decoded binary frame.
#[derive(Debug, Clone, PartialEq)]
pub enum BinaryFrame {
    /// Legacy or raw preview image.
    Preview { mime: String, image: Vec<u8> },
    /// Terminal / log text on a numbered channel.
    Text { channel: u32, text: String },
    /// Preview image with structured metadata.
    PreviewMeta {
        metadata: serde_json::Value,
        mime: String,
        image: Vec<u8>,
    },
}

/// Decode a binary frame.
///
/// Returns `None` for unknown kinds and for frames too short for their
/// kind; both are logged and dropped, never an error.
pub fn parse_binary_frame(data: &[u8]) -> Option<BinaryFrame> {
    if data.len() < 4 {
        tracing::debug!(len = data.len(), "Dropping truncated binary frame");
        return None;
    }

    let kind = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let rest = &data[4..];

    match kind {
        KIND_PREVIEW_LEGACY => parse_legacy_preview(rest),
        KIND_PREVIEW_RAW => Some(BinaryFrame::Preview {
            mime: DEFAULT_PREVIEW_MIME.to_string(),
            image: rest.to_vec(),
        }),
        KIND_TEXT => parse_text_frame(rest),
        KIND_PREVIEW_META => parse_preview_meta(rest),
        other => {
            tracing::debug!(kind = other, "Ignoring binary frame of unknown kind");
            None
        }
    }
}

fn parse_legacy_preview(rest: &[u8]) -> Option<BinaryFrame> {
    if rest.len() < 4 {
        tracing::debug!("Dropping truncated legacy preview frame");
        return None;
    }
    let image_type = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
    let mime = match image_type {
        1 => "image/jpeg",
        2 => "image/png",
        _ => DEFAULT_PREVIEW_MIME,
    };
    Some(BinaryFrame::Preview {
        mime: mime.to_string(),
        image: rest[4..].to_vec(),
    })
}

fn parse_text_frame(rest: &[u8]) -> Option<BinaryFrame> {
    if rest.len() < 4 {
        tracing::debug!("Dropping truncated text frame");
        return None;
    }
    let channel = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
    let text = String::from_utf8_lossy(&rest[4..]).into_owned();
    Some(BinaryFrame::Text { channel, text })
}

fn parse_preview_meta(rest: &[u8]) -> Option<BinaryFrame> {
    if rest.len() < 4 {
        tracing::debug!("Dropping truncated preview-meta frame");
        return None;
    }
    let meta_len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    let body = &rest[4..];
    if meta_len > body.len() {
        tracing::debug!(
            meta_len,
            body_len = body.len(),
            "Dropping preview-meta frame with oversized metadata length",
        );
        return None;
    }

    let metadata: serde_json::Value = match serde_json::from_slice(&body[..meta_len]) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "Dropping preview-meta frame with invalid metadata JSON");
            return None;
        }
    };

    let mime = metadata
        .get("image_type")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_PREVIEW_MIME)
        .to_string();

    Some(BinaryFrame::PreviewMeta {
        metadata,
        mime,
        image: body[meta_len..].to_vec(),
    })
}
