use std::time::{SystemTime, UNIX_EPOCH};

use crate::ids::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    Image {
        blob_id: String,
    },
    File {
        blob_id: String,
        name: Option<String>,
    },
}

impl ContentPart {
    pub fn blob_id(&self) -> Option<&str> {
        match self {
            Self::Text(_) => None,
            Self::Image { blob_id } | Self::File { blob_id, .. } => Some(blob_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl MessageContent {
    /// Text of every text part; attachments contribute nothing.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text(text) => Some(text.as_str()),
                    ContentPart::Image { .. } | ContentPart::File { .. } => None,
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }

    pub fn attachment_ids(&self) -> Vec<&str> {
        match self {
            Self::Text(_) => Vec::new(),
            Self::Parts(parts) => parts.iter().filter_map(ContentPart::blob_id).collect(),
        }
    }

    pub fn parts(&self) -> Vec<ContentPart> {
        match self {
            Self::Text(text) => vec![ContentPart::Text(text.clone())],
            Self::Parts(parts) => parts.clone(),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    /// Queued locally in batched mode, not yet sent.
    Pending,
    Streaming,
    Done,
    Interrupted(String),
    Cancelled,
}

impl MessageStatus {
    /// Frozen messages never take further content changes.
    pub fn is_frozen(&self) -> bool {
        matches!(self, Self::Done | Self::Interrupted(_) | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: MessageContent,
    /// Unix milliseconds.
    pub created_at: u64,
    pub status: MessageStatus,
    /// Server copy of a local message, once known.
    pub remote: Option<u64>,
}

impl Message {
    pub fn new(id: MessageId, role: Role, content: MessageContent, status: MessageStatus) -> Self {
        Self {
            id,
            role,
            content,
            created_at: now_unix_millis(),
            status,
            remote: None,
        }
    }

    pub fn user(id: MessageId, content: MessageContent) -> Self {
        Self::new(id, Role::User, content, MessageStatus::Pending)
    }

    pub fn assistant_placeholder(id: MessageId) -> Self {
        Self::new(
            id,
            Role::Assistant,
            MessageContent::default(),
            MessageStatus::Streaming,
        )
    }

    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_remote(mut self, remote: u64) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Id the backend knows this message by, if any.
    pub fn backend_id(&self) -> Option<u64> {
        self.id.server().or(self.remote)
    }
}

/// Partial update applied via `TranscriptStore::update`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePatch {
    pub content: Option<MessageContent>,
    pub status: Option<MessageStatus>,
}

impl MessagePatch {
    pub fn content(content: impl Into<MessageContent>) -> Self {
        Self {
            content: Some(content.into()),
            status: None,
        }
    }

    pub fn status(status: MessageStatus) -> Self {
        Self {
            content: None,
            status: Some(status),
        }
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Identifies one reply stream within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTicket(pub u64);

/// Per-session send lifecycle; a session accepts one outstanding stream at a time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming(StreamTicket),
    Done(StreamTicket),
    Error {
        ticket: StreamTicket,
        message: String,
    },
    Cancelled(StreamTicket),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamTicket),
    Complete(StreamTicket),
    Fail {
        ticket: StreamTicket,
        message: String,
    },
    Cancel(StreamTicket),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: StreamTicket,
        attempted: StreamTicket,
    },
    NoActiveStream,
    TicketMismatch {
        active: StreamTicket,
        attempted: StreamTicket,
    },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    pub fn active_ticket(&self) -> Option<StreamTicket> {
        match self {
            Self::Streaming(ticket) => Some(*ticket),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }

    /// Terminal transitions must name the active ticket exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(ticket) => match self {
                Self::Streaming(active) if *active != ticket => {
                    Err(StreamTransitionRejection::AlreadyStreaming {
                        active: *active,
                        attempted: ticket,
                    })
                }
                Self::Streaming(_) => Ok(self.clone()),
                Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                    Ok(Self::Streaming(ticket))
                }
            },
            StreamTransition::Complete(ticket) => {
                self.finish(ticket, || Self::Done(ticket))
            }
            StreamTransition::Fail { ticket, message } => {
                self.finish(ticket, || Self::Error { ticket, message })
            }
            StreamTransition::Cancel(ticket) => self.finish(ticket, || Self::Cancelled(ticket)),
        }
    }

    fn finish(&self, ticket: StreamTicket, next: impl FnOnce() -> Self) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == ticket => Ok(next()),
            Self::Streaming(active) => Err(StreamTransitionRejection::TicketMismatch {
                active: *active,
                attempted: ticket,
            }),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }
}

pub(crate) fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
