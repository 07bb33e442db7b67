use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

use crate::error::{BackendResult, FailureKind};
use crate::wire::{CompletionRequest, CompletionResponse, HistoryPage, HistoryQuery};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type BackendWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Backend-agnostic events for one streaming completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Failed { kind: FailureKind, message: String },
}

pub struct CompletionEventStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// Event stream plus the worker future that feeds it. The caller decides where the
/// worker runs; dropping the stream signals the worker to stop reading.
pub struct CompletionStreamHandle {
    pub stream: CompletionEventStream,
    pub worker: BackendWorker,
}

impl CompletionEventStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for CompletionEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Builds a connected event stream for backends and test doubles.
pub fn make_event_stream() -> (
    mpsc::UnboundedSender<StreamEvent>,
    CompletionEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        CompletionEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}

pub trait ChatBackend: Send + Sync {
    fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> BackendResult<CompletionStreamHandle>;
    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
    ) -> BoxFuture<'a, BackendResult<CompletionResponse>>;
    fn fetch_history<'a>(
        &'a self,
        session_id: &'a str,
        query: HistoryQuery,
    ) -> BoxFuture<'a, BackendResult<HistoryPage>>;
    fn delete_message<'a>(
        &'a self,
        session_id: &'a str,
        message_id: u64,
    ) -> BoxFuture<'a, BackendResult<()>>;
}
