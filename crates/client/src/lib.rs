//! Wire-level collaborators of the transcript sync engine: the chat backend, auth,
//! the trace push channel and attachment storage.

mod auth;
mod backend;
mod backoff;
mod blob;
mod error;
mod http;
mod line_buffer;
mod trace_channel;
pub mod wire;

pub use auth::{AuthProvider, StaticToken};
pub use backend::{
    BackendWorker, BoxFuture, ChatBackend, CompletionEventStream, CompletionStreamHandle,
    StreamEvent, make_event_stream,
};
pub use backoff::backoff;
pub use blob::{Blob, BlobStore, MemoryBlobStore};
pub use error::{BackendError, BackendResult, FailureKind};
pub use http::{BackendConfig, DEFAULT_STREAM_SENTINEL, HttpBackend};
pub use line_buffer::{LineBuffer, StreamLine, parse_stream_line};
pub use trace_channel::{TraceChannelConfig, TraceFeed, TraceFeedHandle, TraceFeedItem};
