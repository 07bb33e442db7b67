use std::sync::Arc;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};

use crate::backend::BackendWorker;
use crate::backoff::backoff;
use crate::error::FailureKind;
use crate::http::{HttpBackend, HttpInner};
use crate::wire::WireTraceEvent;

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceChannelConfig {
    pub path: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for TraceChannelConfig {
    fn default() -> Self {
        Self {
            path: "trace/stream".to_string(),
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceFeedItem {
    Connected,
    Event(WireTraceEvent),
    Disconnected { attempt: u64, retry_in: Duration },
    /// Terminal: the channel gave up (credential rejected after re-authentication).
    Fatal(String),
}

pub struct TraceFeed {
    items: mpsc::UnboundedReceiver<TraceFeedItem>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct TraceFeedHandle {
    pub feed: TraceFeed,
    pub worker: BackendWorker,
}

impl TraceFeed {
    pub fn new(
        items: mpsc::UnboundedReceiver<TraceFeedItem>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            items,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<TraceFeedItem> {
        self.items.recv().await
    }

    pub fn close(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for TraceFeed {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

enum SessionEnd {
    Disconnected(String),
    Fatal(String),
    ReceiverGone,
}

impl HttpBackend {
    /// Opens the server-push trace channel. The worker reconnects with backoff until the
    /// feed is dropped or the credential is rejected twice in a row.
    pub fn open_trace_feed(&self, config: TraceChannelConfig) -> TraceFeedHandle {
        let (item_tx, item_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let worker: BackendWorker = Box::pin(run_trace_worker(
            self.inner.clone(),
            config,
            item_tx,
            cancel_rx,
        ));

        TraceFeedHandle {
            feed: TraceFeed::new(item_rx, cancel_tx),
            worker,
        }
    }
}

async fn run_trace_worker(
    inner: Arc<HttpInner>,
    config: TraceChannelConfig,
    item_tx: mpsc::UnboundedSender<TraceFeedItem>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let mut attempt = 0u64;

    loop {
        let end = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!("trace channel closed by consumer");
                return;
            }
            end = pump_session(&inner, &config, &item_tx, &mut attempt) => end,
        };

        match end {
            SessionEnd::ReceiverGone => return,
            SessionEnd::Fatal(message) => {
                tracing::error!(error = %message, "trace channel stopped");
                let _ = item_tx.send(TraceFeedItem::Fatal(message));
                return;
            }
            SessionEnd::Disconnected(reason) => {
                attempt = attempt.saturating_add(1);
                let retry_in = backoff(attempt, config.initial_backoff, config.max_backoff);
                tracing::warn!(
                    attempt,
                    retry_in_ms = retry_in.as_millis() as u64,
                    reason = %reason,
                    "trace channel disconnected; reconnecting"
                );
                if item_tx
                    .send(TraceFeedItem::Disconnected { attempt, retry_in })
                    .is_err()
                {
                    return;
                }

                tokio::select! {
                    _ = &mut cancel_rx => return,
                    _ = tokio::time::sleep(retry_in) => {}
                }
            }
        }
    }
}

async fn pump_session(
    inner: &HttpInner,
    config: &TraceChannelConfig,
    item_tx: &mpsc::UnboundedSender<TraceFeedItem>,
    attempt: &mut u64,
) -> SessionEnd {
    let url = inner.config.url(&config.path);
    let response = inner
        .send_authorized("open-trace-channel", |client, token| {
            client
                .get(&url)
                .bearer_auth(token)
                .header(reqwest::header::ACCEPT, "text/event-stream")
        })
        .await;

    let response = match response {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            return SessionEnd::Disconnected(format!("status {}", response.status().as_u16()));
        }
        Err(error) if error.kind() == FailureKind::AuthExpired => {
            return SessionEnd::Fatal(error.to_string());
        }
        Err(error) => return SessionEnd::Disconnected(error.to_string()),
    };

    *attempt = 0;
    if item_tx.send(TraceFeedItem::Connected).is_err() {
        return SessionEnd::ReceiverGone;
    }

    let mut events = response.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(error) => return SessionEnd::Disconnected(error.to_string()),
        };
        if event.data.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<WireTraceEvent>(&event.data) {
            Ok(parsed) => {
                if item_tx.send(TraceFeedItem::Event(parsed)).is_err() {
                    return SessionEnd::ReceiverGone;
                }
            }
            Err(error) => {
                tracing::debug!(error = %error, "dropped malformed trace event");
            }
        }
    }

    SessionEnd::Disconnected("server closed the stream".to_string())
}
