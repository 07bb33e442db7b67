use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use crate::auth::AuthProvider;
use crate::backend::{
    BackendWorker, BoxFuture, ChatBackend, CompletionStreamHandle, StreamEvent, make_event_stream,
};
use crate::error::{
    AuthExpiredSnafu, BackendError, BackendResult, BuildClientSnafu, DecodeSnafu,
    EmptyMessageSnafu, ReadBodySnafu, RequestSnafu, StatusSnafu, StreamEndedSnafu,
};
use crate::line_buffer::{LineBuffer, StreamLine, parse_stream_line};
use crate::wire::{CompletionRequest, CompletionResponse, HistoryPage, HistoryQuery};

pub const DEFAULT_STREAM_SENTINEL: &str = "[DONE]";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub endpoint: String,
    pub stream_sentinel: String,
    pub connect_timeout: Duration,
    /// Applies to non-streaming calls only; streams stay open until the sentinel.
    pub request_timeout: Duration,
}

impl BackendConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().trim_end_matches('/').to_string(),
            stream_sentinel: DEFAULT_STREAM_SENTINEL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_stream_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.stream_sentinel = sentinel.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }
}

/// `ChatBackend` over HTTP with bearer auth and a single re-authentication retry.
#[derive(Clone)]
pub struct HttpBackend {
    pub(crate) inner: Arc<HttpInner>,
}

pub(crate) struct HttpInner {
    pub(crate) client: reqwest::Client,
    pub(crate) config: BackendConfig,
    pub(crate) auth: Arc<dyn AuthProvider>,
}

impl HttpBackend {
    pub fn new(config: BackendConfig, auth: Arc<dyn AuthProvider>) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "http-backend-new",
            })?;

        Ok(Self {
            inner: Arc::new(HttpInner {
                client,
                config,
                auth,
            }),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.inner.config
    }
}

impl HttpInner {
    /// Sends with the current credential. A 401 triggers one re-authentication and one
    /// retry; a second consecutive 401 is fatal.
    pub(crate) async fn send_authorized<F>(
        &self,
        stage: &'static str,
        build: F,
    ) -> BackendResult<reqwest::Response>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder + Send + Sync,
    {
        let token = self.auth.credential().await?;
        let response = build(&self.client, &token)
            .send()
            .await
            .context(RequestSnafu { stage })?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::warn!(stage, "request unauthorized; re-authenticating once");
        let token = self.auth.reauthenticate().await?;
        let response = build(&self.client, &token)
            .send()
            .await
            .context(RequestSnafu { stage })?;
        ensure!(
            response.status() != StatusCode::UNAUTHORIZED,
            AuthExpiredSnafu { stage }
        );
        Ok(response)
    }

    async fn ensure_success(
        response: reqwest::Response,
        stage: &'static str,
    ) -> BackendResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        StatusSnafu {
            stage,
            status: status.as_u16(),
            body,
        }
        .fail()
    }

    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
        stage: &'static str,
    ) -> BackendResult<T> {
        let body = response.text().await.context(ReadBodySnafu { stage })?;
        serde_json::from_str(&body).context(DecodeSnafu { stage })
    }

    async fn open_stream(&self, request: &CompletionRequest) -> BackendResult<reqwest::Response> {
        let url = self.config.url("chat/completions");
        let response = self
            .send_authorized("open-completion-stream", |client, token| {
                client.post(&url).bearer_auth(token).json(request)
            })
            .await?;
        Self::ensure_success(response, "completion-stream-status").await
    }

    fn emit_failure(event_tx: &mpsc::UnboundedSender<StreamEvent>, error: &BackendError) {
        let _ = event_tx.send(StreamEvent::Failed {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    async fn run_stream_worker(
        self: Arc<Self>,
        request: CompletionRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let session_id = request.session_id.clone();
        let response = match self.open_stream(&request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %error,
                    "failed to open completion stream"
                );
                Self::emit_failure(&event_tx, &error);
                return;
            }
        };

        let sentinel = self.config.stream_sentinel.as_str();
        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut dropped_records = 0usize;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(session_id = %session_id, "completion stream cancelled");
                    return;
                }
                chunk = body.next() => {
                    let (complete_lines, body_ended) = match chunk {
                        Some(Ok(bytes)) => (lines.push(&bytes), false),
                        Some(Err(source)) => {
                            let error = BackendError::Request {
                                stage: "completion-stream-chunk",
                                source,
                            };
                            tracing::warn!(
                                session_id = %session_id,
                                error = %error,
                                "completion stream reset"
                            );
                            Self::emit_failure(&event_tx, &error);
                            return;
                        }
                        // A sentinel without its trailing newline is still a clean finish.
                        None => (lines.finish().into_iter().collect::<Vec<_>>(), true),
                    };

                    for line in complete_lines {
                        match parse_stream_line(&line, sentinel) {
                            StreamLine::Blank => {}
                            StreamLine::Sentinel => {
                                let _ = event_tx.send(StreamEvent::Done);
                                return;
                            }
                            StreamLine::Record(content) => {
                                if event_tx.send(StreamEvent::Delta(content)).is_err() {
                                    return;
                                }
                            }
                            StreamLine::Malformed => {
                                dropped_records += 1;
                                tracing::debug!(
                                    session_id = %session_id,
                                    dropped_records,
                                    "dropped malformed stream record"
                                );
                            }
                        }
                    }

                    if body_ended {
                        let error = StreamEndedSnafu {
                            stage: "completion-stream-eof",
                        }
                        .build();
                        Self::emit_failure(&event_tx, &error);
                        return;
                    }
                }
            }
        }
    }
}

impl ChatBackend for HttpBackend {
    fn stream_completion(
        &self,
        mut request: CompletionRequest,
    ) -> BackendResult<CompletionStreamHandle> {
        ensure!(
            !request.message.is_empty(),
            EmptyMessageSnafu {
                stage: "stream-completion",
                session_id: request.session_id.clone(),
            }
        );
        request.stream = true;

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: BackendWorker = Box::pin(HttpInner::run_stream_worker(
            self.inner.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(CompletionStreamHandle { stream, worker })
    }

    fn complete<'a>(
        &'a self,
        mut request: CompletionRequest,
    ) -> BoxFuture<'a, BackendResult<CompletionResponse>> {
        Box::pin(async move {
            ensure!(
                !request.message.is_empty(),
                EmptyMessageSnafu {
                    stage: "complete",
                    session_id: request.session_id.clone(),
                }
            );
            request.stream = false;

            let url = self.inner.config.url("chat/completions");
            let timeout = self.inner.config.request_timeout;
            let response = self
                .inner
                .send_authorized("complete", |client, token| {
                    client
                        .post(&url)
                        .bearer_auth(token)
                        .timeout(timeout)
                        .json(&request)
                })
                .await?;
            let response = HttpInner::ensure_success(response, "complete-status").await?;
            HttpInner::read_json(response, "complete-decode").await
        })
    }

    fn fetch_history<'a>(
        &'a self,
        session_id: &'a str,
        query: HistoryQuery,
    ) -> BoxFuture<'a, BackendResult<HistoryPage>> {
        Box::pin(async move {
            let url = self
                .inner
                .config
                .url(&format!("sessions/{session_id}/messages"));
            let timeout = self.inner.config.request_timeout;
            let response = self
                .inner
                .send_authorized("fetch-history", |client, token| {
                    let mut builder = client
                        .get(&url)
                        .bearer_auth(token)
                        .timeout(timeout)
                        .query(&[("limit", query.limit)]);
                    if let Some(before_id) = query.before_id {
                        builder = builder.query(&[("before_id", before_id)]);
                    }
                    builder
                })
                .await?;
            let response = HttpInner::ensure_success(response, "fetch-history-status").await?;
            HttpInner::read_json(response, "fetch-history-decode").await
        })
    }

    fn delete_message<'a>(
        &'a self,
        session_id: &'a str,
        message_id: u64,
    ) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let url = self
                .inner
                .config
                .url(&format!("sessions/{session_id}/messages/{message_id}"));
            let timeout = self.inner.config.request_timeout;
            let response = self
                .inner
                .send_authorized("delete-message", |client, token| {
                    client.delete(&url).bearer_auth(token).timeout(timeout)
                })
                .await?;

            if response.status() == StatusCode::NOT_FOUND {
                tracing::debug!(
                    session_id,
                    message_id,
                    "message already absent on backend"
                );
                return Ok(());
            }
            HttpInner::ensure_success(response, "delete-message-status").await?;
            Ok(())
        })
    }
}
