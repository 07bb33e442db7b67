use regex::Regex;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use zova_client::wire::CompletionRequest;
use zova_client::{ChatBackend, CompletionStreamHandle, FailureKind, StreamEvent};

use crate::error::{InvalidMarkerPatternSnafu, SyncResult};
use crate::ids::MessageId;
use crate::message::{Message, MessageContent, MessagePatch, MessageStatus};
use crate::store::{TranscriptStore, UpdateOutcome};

/// Matches an inline usage annotation such as `<!-- usage: 812 -->`.
pub const DEFAULT_USAGE_MARKER_PATTERN: &str = r"<!--\s*usage:\s*(\d+)[^>]*-->";

/// Strips usage annotations from finished reply text.
#[derive(Debug, Clone)]
pub struct UsageMarker {
    pattern: Regex,
}

impl UsageMarker {
    pub fn new(pattern: &str) -> SyncResult<Self> {
        let pattern = Regex::new(pattern).context(InvalidMarkerPatternSnafu {
            stage: "compile-usage-marker",
            pattern: pattern.to_string(),
        })?;
        Ok(Self { pattern })
    }

    /// Returns the text without markers and the last reported usage, if any.
    pub fn strip(&self, text: &str) -> (String, Option<u64>) {
        let usage = self
            .pattern
            .captures_iter(text)
            .filter_map(|captures| captures.get(1)?.as_str().parse::<u64>().ok())
            .last();
        if !self.pattern.is_match(text) {
            return (text.to_string(), usage);
        }

        let stripped = self.pattern.replace_all(text, "");
        (stripped.trim_end().to_string(), usage)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Completed {
        content: String,
        usage: Option<u64>,
    },
    Aborted {
        content: String,
    },
    Failed {
        content: String,
        kind: FailureKind,
        message: String,
    },
}

impl IngestOutcome {
    pub fn content(&self) -> &str {
        match self {
            Self::Completed { content, .. }
            | Self::Aborted { content }
            | Self::Failed { content, .. } => content,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Drives one reply stream into a placeholder message.
#[derive(Debug, Clone)]
pub struct StreamIngestor {
    marker: UsageMarker,
}

impl StreamIngestor {
    pub fn new(marker: UsageMarker) -> Self {
        Self { marker }
    }

    /// Inserts a placeholder under `placeholder_id` and grows it delta by delta.
    ///
    /// `on_delta` sees each delta together with the accumulated text. Cancelling `abort`
    /// stops consumption; content received so far is kept.
    pub async fn consume<F>(
        &self,
        backend: &dyn ChatBackend,
        request: CompletionRequest,
        store: &TranscriptStore,
        placeholder_id: MessageId,
        abort: &CancellationToken,
        mut on_delta: F,
    ) -> IngestOutcome
    where
        F: FnMut(&str, &str),
    {
        let session_id = request.session_id.clone();
        store.append(Message::assistant_placeholder(placeholder_id));

        let CompletionStreamHandle { mut stream, worker } =
            match backend.stream_completion(request) {
                Ok(handle) => handle,
                Err(error) => {
                    return self.finalize(
                        store,
                        placeholder_id,
                        IngestOutcome::Failed {
                            content: String::new(),
                            kind: error.kind(),
                            message: error.to_string(),
                        },
                    );
                }
            };
        tokio::spawn(worker);

        let mut accumulated = String::new();
        let mut deltas = 0usize;
        let outcome = loop {
            tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    stream.cancel();
                    tracing::info!(session_id = %session_id, deltas, "reply stream aborted");
                    break IngestOutcome::Aborted { content: accumulated };
                }
                event = stream.recv() => match event {
                    Some(StreamEvent::Delta(delta)) => {
                        accumulated.push_str(&delta);
                        deltas += 1;
                        let applied = store.update(
                            placeholder_id,
                            MessagePatch::content(MessageContent::Text(accumulated.clone())),
                        );
                        if applied != UpdateOutcome::Applied {
                            // Deleted or frozen while the stream was suspended.
                            stream.cancel();
                            tracing::debug!(
                                session_id = %session_id,
                                message_id = %placeholder_id,
                                ?applied,
                                "placeholder gone; stopping stream"
                            );
                            break IngestOutcome::Aborted { content: accumulated };
                        }
                        on_delta(&delta, &accumulated);
                    }
                    Some(StreamEvent::Done) => {
                        let (content, usage) = self.marker.strip(&accumulated);
                        tracing::debug!(session_id = %session_id, deltas, ?usage, "reply stream completed");
                        break IngestOutcome::Completed { content, usage };
                    }
                    Some(StreamEvent::Failed { kind, message }) => {
                        tracing::warn!(session_id = %session_id, ?kind, error = %message, "reply stream failed");
                        break IngestOutcome::Failed { content: accumulated, kind, message };
                    }
                    None => {
                        break IngestOutcome::Failed {
                            content: accumulated,
                            kind: FailureKind::Network,
                            message: "stream closed without a terminal event".to_string(),
                        };
                    }
                }
            }
        };

        self.finalize(store, placeholder_id, outcome)
    }

    fn finalize(
        &self,
        store: &TranscriptStore,
        placeholder_id: MessageId,
        outcome: IngestOutcome,
    ) -> IngestOutcome {
        let patch = match &outcome {
            IngestOutcome::Completed { content, .. } => {
                MessagePatch::content(content.clone()).with_status(MessageStatus::Done)
            }
            IngestOutcome::Aborted { .. } => MessagePatch::status(MessageStatus::Cancelled),
            IngestOutcome::Failed { message, .. } => {
                MessagePatch::status(MessageStatus::Interrupted(message.clone()))
            }
        };
        store.update(placeholder_id, patch);
        outcome
    }
}
