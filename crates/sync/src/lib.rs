//! Client-side transcript synchronization: an ordered per-session message store kept
//! consistent with a remote chat backend across history paging, streamed replies,
//! batched sends, regeneration and a live trace feed.

pub mod attachments;
mod convert;
mod coordinator;
mod error;
mod ids;
mod ingest;
mod message;
mod notice;
mod paginator;
mod scroll;
mod settings;
mod store;
mod trace;

pub use coordinator::{ComposeOutcome, FlushOutcome, SendCoordinator, Session, split_turns};
pub use error::{SyncError, SyncResult};
pub use ids::{LocalId, MessageId, RequestId, SessionId};
pub use ingest::{DEFAULT_USAGE_MARKER_PATTERN, IngestOutcome, StreamIngestor, UsageMarker};
pub use message::{
    ContentPart, Message, MessageContent, MessagePatch, MessageStatus, Role, StreamState,
    StreamTicket, StreamTransition, StreamTransitionRejection,
};
pub use notice::{Notice, NoticeBoard, NoticeKind};
pub use paginator::{HistoryPaginator, PageOutcome};
pub use scroll::{AnchorSnapshot, ScrollAnchor, Viewport};
pub use settings::{
    DEFAULT_BATCH_DELIMITER, DEFAULT_ENDPOINT, DEFAULT_PAGE_SIZE, DeliveryMode, SettingsError,
    SettingsStore, SyncSettings,
};
pub use store::{MergeOutcome, TranscriptEvent, TranscriptStore, UpdateOutcome};
pub use trace::{
    Block, BlockType, ChannelStatus, LiveTraceReconstructor, Round, TraceEvent, TraceItem,
    TraceLog, TraceUpdate,
};
