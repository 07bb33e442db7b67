//! JSON shapes exchanged with the completion, history and trace endpoints.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    System,
    User,
    Assistant,
}

/// One typed content part. History pages reference attachments by `blob_id`;
/// outbound completion requests carry the resolved bytes inline as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WirePart {
    Text {
        text: String,
    },
    Image {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blob_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    File {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blob_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

impl WireContent {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }

    /// Concatenated text of every text part, ignoring attachments.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    WirePart::Text { text } => Some(text.as_str()),
                    WirePart::Image { .. } | WirePart::File { .. } => None,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub id: Option<u64>,
    pub role: WireRole,
    pub content: WireContent,
    /// Unix milliseconds.
    #[serde(default)]
    pub created_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub message: WireContent,
    pub stream: bool,
}

impl CompletionRequest {
    pub fn streaming(session_id: impl Into<String>, message: WireContent) -> Self {
        Self {
            session_id: session_id.into(),
            message,
            stream: true,
        }
    }

    pub fn non_streaming(session_id: impl Into<String>, message: WireContent) -> Self {
        Self {
            session_id: session_id.into(),
            message,
            stream: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryQuery {
    pub limit: usize,
    pub before_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    // A missing flag means the server did not promise more; length is never consulted.
    #[serde(default)]
    pub has_more: bool,
}

/// One line of a streaming completion body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamRecord {
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireBlockType {
    Thinking,
    Text,
    ToolUse,
    ToolResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceBlockEvent {
    pub request_id: String,
    pub round_index: u32,
    pub block_type: WireBlockType,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneTag {
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceDoneEvent {
    #[serde(rename = "type")]
    pub kind: DoneTag,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTraceEvent {
    Done(TraceDoneEvent),
    Block(TraceBlockEvent),
}

impl WireTraceEvent {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Done(done) => &done.request_id,
            Self::Block(block) => &block.request_id,
        }
    }
}
