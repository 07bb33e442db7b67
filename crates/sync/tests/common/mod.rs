#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use zova_client::wire::{
    CompletionRequest, CompletionResponse, HistoryPage, HistoryQuery, WireContent, WireMessage,
    WireRole,
};
use zova_client::{
    BackendError, BackendResult, BackendWorker, BoxFuture, ChatBackend, CompletionStreamHandle,
    FailureKind, StreamEvent, make_event_stream,
};

pub enum Step {
    Event(StreamEvent),
    /// Keeps the stream open until the consumer cancels it.
    Hang,
}

pub fn delta(text: &str) -> Step {
    Step::Event(StreamEvent::Delta(text.to_string()))
}

pub fn done() -> Step {
    Step::Event(StreamEvent::Done)
}

pub fn fail(kind: FailureKind, message: &str) -> Step {
    Step::Event(StreamEvent::Failed {
        kind,
        message: message.to_string(),
    })
}

type DeleteHook = Box<dyn Fn(u64) + Send + Sync>;

/// In-memory `ChatBackend` that replays scripted streams, responses and pages and
/// records every request it sees.
#[derive(Default)]
pub struct ScriptedBackend {
    streams: Mutex<VecDeque<Vec<Step>>>,
    completions: Mutex<VecDeque<BackendResult<CompletionResponse>>>,
    pages: Mutex<VecDeque<HistoryPage>>,
    delete_results: Mutex<VecDeque<BackendResult<()>>>,
    delete_hook: Mutex<Option<DeleteHook>>,
    page_gate: Mutex<Option<Arc<Notify>>>,
    pub stream_requests: Mutex<Vec<CompletionRequest>>,
    pub complete_requests: Mutex<Vec<CompletionRequest>>,
    pub history_queries: Mutex<Vec<HistoryQuery>>,
    pub deletes: Mutex<Vec<u64>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_stream(&self, steps: Vec<Step>) {
        self.streams.lock().unwrap().push_back(steps);
    }

    pub fn script_completion(&self, result: BackendResult<CompletionResponse>) {
        self.completions.lock().unwrap().push_back(result);
    }

    pub fn script_page(&self, page: HistoryPage) {
        self.pages.lock().unwrap().push_back(page);
    }

    pub fn script_delete(&self, result: BackendResult<()>) {
        self.delete_results.lock().unwrap().push_back(result);
    }

    pub fn on_delete(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.delete_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// History fetches wait for a permit on the returned gate.
    pub fn gate_pages(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.page_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn last_stream_text(&self) -> Option<String> {
        self.stream_requests
            .lock()
            .unwrap()
            .last()
            .map(|request| request.message.text())
    }
}

impl ChatBackend for ScriptedBackend {
    fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> BackendResult<CompletionStreamHandle> {
        self.stream_requests.lock().unwrap().push(request);
        let steps = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![done()]);

        let (event_tx, stream, mut cancel_rx) = make_event_stream();
        let worker: BackendWorker = Box::pin(async move {
            for step in steps {
                match step {
                    Step::Event(event) => {
                        if event_tx.send(event).is_err() {
                            return;
                        }
                    }
                    Step::Hang => {
                        let _ = (&mut cancel_rx).await;
                        return;
                    }
                }
            }
        });
        Ok(CompletionStreamHandle { stream, worker })
    }

    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
    ) -> BoxFuture<'a, BackendResult<CompletionResponse>> {
        self.complete_requests.lock().unwrap().push(request);
        let result = self
            .completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(CompletionResponse::default()));
        Box::pin(async move { result })
    }

    fn fetch_history<'a>(
        &'a self,
        _session_id: &'a str,
        query: HistoryQuery,
    ) -> BoxFuture<'a, BackendResult<HistoryPage>> {
        self.history_queries.lock().unwrap().push(query);
        let page = self.pages.lock().unwrap().pop_front().unwrap_or_default();
        let gate = self.page_gate.lock().unwrap().clone();
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            Ok(page)
        })
    }

    fn delete_message<'a>(
        &'a self,
        _session_id: &'a str,
        message_id: u64,
    ) -> BoxFuture<'a, BackendResult<()>> {
        self.deletes.lock().unwrap().push(message_id);
        if let Some(hook) = self.delete_hook.lock().unwrap().as_ref() {
            hook(message_id);
        }
        let result = self
            .delete_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        Box::pin(async move {
            tokio::task::yield_now().await;
            result
        })
    }
}

pub fn wire(id: u64, role: WireRole, text: &str) -> WireMessage {
    WireMessage {
        id: Some(id),
        role,
        content: WireContent::Text(text.to_string()),
        created_at: Some(id * 1_000),
    }
}

pub fn page(messages: Vec<WireMessage>, has_more: bool) -> HistoryPage {
    HistoryPage { messages, has_more }
}

pub fn assistant_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        messages: vec![WireMessage {
            id: None,
            role: WireRole::Assistant,
            content: WireContent::Text(text.to_string()),
            created_at: None,
        }],
    }
}

pub fn status_error(status: u16) -> BackendError {
    BackendError::Status {
        stage: "scripted",
        status,
        body: String::new(),
    }
}

pub fn auth_error() -> BackendError {
    BackendError::AuthExpired { stage: "scripted" }
}

/// Yields until `condition` holds, failing the test after a generous bound.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached");
}
