//! Attachment markers in text, blob resolution for outbound payloads and for display.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use zova_client::wire::{WireContent, WirePart};
use zova_client::{Blob, BlobStore};

use crate::error::{SyncError, SyncResult};
use crate::message::{ContentPart, MessageContent};

const MARKER_OPEN: &str = "[[";
const MARKER_CLOSE: &str = "]]";

/// Text that stands in for a blob the store no longer has.
pub fn unavailable_placeholder(blob_id: &str) -> String {
    format!("[attachment unavailable: {blob_id}]")
}

/// Splits `[[image:ID]]` and `[[file:ID|name]]` markers out of plain text.
/// Anything that does not parse as a marker stays literal text.
pub fn parse_markers(text: &str) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut rest = text;

    while let Some(start) = rest.find(MARKER_OPEN) {
        let inner_start = start + MARKER_OPEN.len();
        let Some(inner_len) = rest[inner_start..].find(MARKER_CLOSE) else {
            break;
        };
        let inner = &rest[inner_start..inner_start + inner_len];

        match parse_marker(inner) {
            Some(part) => {
                literal.push_str(&rest[..start]);
                if !literal.is_empty() {
                    parts.push(ContentPart::Text(std::mem::take(&mut literal)));
                }
                parts.push(part);
                rest = &rest[inner_start + inner_len + MARKER_CLOSE.len()..];
            }
            None => {
                // The next marker may open inside this one.
                literal.push_str(&rest[..start + 1]);
                rest = &rest[start + 1..];
            }
        }
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        parts.push(ContentPart::Text(literal));
    }
    parts
}

fn parse_marker(inner: &str) -> Option<ContentPart> {
    let (kind, body) = inner.split_once(':')?;
    match kind {
        "image" => valid_blob_id(body).map(|blob_id| ContentPart::Image { blob_id }),
        "file" => {
            let (blob_id, name) = match body.split_once('|') {
                Some((blob_id, name)) => (blob_id, Some(name.trim().to_string())),
                None => (body, None),
            };
            valid_blob_id(blob_id).map(|blob_id| ContentPart::File {
                blob_id,
                name: name.filter(|name| !name.is_empty()),
            })
        }
        _ => None,
    }
}

fn valid_blob_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let valid = !raw.is_empty()
        && raw
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    valid.then(|| raw.to_string())
}

/// Plain text stays `Text`; text carrying markers becomes typed parts.
pub fn content_from_text(text: String) -> MessageContent {
    let parts = parse_markers(&text);
    if parts.iter().all(|part| matches!(part, ContentPart::Text(_))) {
        MessageContent::Text(text)
    } else {
        MessageContent::Parts(parts)
    }
}

/// Stores `blob` and appends a typed reference to it after `text`.
/// Images become image parts; everything else is attached as a file.
pub async fn attach(
    blobs: &dyn BlobStore,
    text: &str,
    blob: Blob,
    name: Option<String>,
) -> SyncResult<MessageContent> {
    let is_image = blob.mime_type.starts_with("image/");
    let blob_id = blobs
        .put(blob)
        .await
        .map_err(|source| SyncError::from_backend("store-attachment", source))?;
    tracing::debug!(blob_id = %blob_id, is_image, "attachment stored");

    let mut parts = parse_markers(text);
    parts.push(if is_image {
        ContentPart::Image { blob_id }
    } else {
        ContentPart::File { blob_id, name }
    });
    Ok(MessageContent::Parts(parts))
}

async fn resolve(blobs: &dyn BlobStore, blob_id: &str) -> Option<Blob> {
    match blobs.get(blob_id).await {
        Ok(Some(blob)) => Some(blob),
        Ok(None) => {
            tracing::warn!(blob_id, "attachment missing from blob store");
            None
        }
        Err(error) => {
            tracing::warn!(blob_id, error = %error, "attachment lookup failed");
            None
        }
    }
}

/// Wire parts for one message, blobs inlined as base64.
pub async fn wire_parts(content: &MessageContent, blobs: &dyn BlobStore) -> Vec<WirePart> {
    let mut wire = Vec::new();
    for part in content.parts() {
        let resolved = match &part {
            ContentPart::Text(text) => {
                wire.push(WirePart::Text { text: text.clone() });
                continue;
            }
            ContentPart::Image { blob_id } | ContentPart::File { blob_id, .. } => {
                resolve(blobs, blob_id).await
            }
        };

        let next = match (part, resolved) {
            (ContentPart::Image { blob_id }, Some(blob)) => WirePart::Image {
                blob_id: Some(blob_id),
                mime_type: Some(blob.mime_type),
                data: Some(STANDARD.encode(&blob.bytes)),
            },
            (ContentPart::File { blob_id, name }, Some(blob)) => WirePart::File {
                blob_id: Some(blob_id),
                name,
                mime_type: Some(blob.mime_type),
                data: Some(STANDARD.encode(&blob.bytes)),
            },
            (ContentPart::Image { blob_id } | ContentPart::File { blob_id, .. }, None) => {
                WirePart::Text {
                    text: unavailable_placeholder(&blob_id),
                }
            }
            (ContentPart::Text(text), _) => WirePart::Text { text },
        };
        wire.push(next);
    }
    wire
}

/// Outbound payload; plain text is sent as a bare string.
pub async fn build_payload(content: &MessageContent, blobs: &dyn BlobStore) -> WireContent {
    match content {
        MessageContent::Text(text) => WireContent::Text(text.clone()),
        MessageContent::Parts(_) => WireContent::Parts(wire_parts(content, blobs).await),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayPart {
    Text(String),
    Image {
        blob_id: String,
        blob: Blob,
    },
    File {
        blob_id: String,
        name: Option<String>,
        blob: Blob,
    },
    Unavailable {
        blob_id: String,
        placeholder: String,
    },
}

/// Resolves attachments for rendering. Missing blobs become placeholders.
pub async fn render_parts(content: &MessageContent, blobs: &dyn BlobStore) -> Vec<DisplayPart> {
    let mut display = Vec::new();
    for part in content.parts() {
        match part {
            ContentPart::Text(text) => display.push(DisplayPart::Text(text)),
            ContentPart::Image { blob_id } => match resolve(blobs, &blob_id).await {
                Some(blob) => display.push(DisplayPart::Image { blob_id, blob }),
                None => display.push(unavailable(blob_id)),
            },
            ContentPart::File { blob_id, name } => match resolve(blobs, &blob_id).await {
                Some(blob) => display.push(DisplayPart::File {
                    blob_id,
                    name,
                    blob,
                }),
                None => display.push(unavailable(blob_id)),
            },
        }
    }
    display
}

fn unavailable(blob_id: String) -> DisplayPart {
    DisplayPart::Unavailable {
        placeholder: unavailable_placeholder(&blob_id),
        blob_id,
    }
}
