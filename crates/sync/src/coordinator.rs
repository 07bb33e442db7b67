use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use zova_client::wire::{CompletionRequest, CompletionResponse, WireContent, WireRole};
use zova_client::{BlobStore, ChatBackend, FailureKind};

use crate::attachments::{build_payload, wire_parts};
use crate::error::{
    MessageNotFoundSnafu, ModeSwitchRejectedSnafu, NoPrecedingUserMessageSnafu,
    NotAnAssistantReplySnafu, SessionNotFoundSnafu, SyncError, SyncResult,
};
use crate::ids::{MessageId, SessionId};
use crate::ingest::{IngestOutcome, StreamIngestor, UsageMarker};
use crate::message::{
    Message, MessageContent, MessagePatch, MessageStatus, Role, StreamState, StreamTicket,
    StreamTransition,
};
use crate::notice::{Notice, NoticeBoard, NoticeKind};
use crate::paginator::HistoryPaginator;
use crate::settings::{DeliveryMode, SyncSettings};
use crate::store::TranscriptStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeOutcome {
    Streamed {
        user_id: MessageId,
        assistant_id: MessageId,
        outcome: IngestOutcome,
    },
    Queued {
        user_id: MessageId,
    },
    /// A reply is already streaming for this session; nothing was inserted.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlushOutcome {
    pub sent: Vec<MessageId>,
    pub inserted: Vec<MessageId>,
    /// Messages put back on the queue after a failed send.
    pub requeued: usize,
}

#[derive(Debug, Default)]
struct SessionState {
    mode: DeliveryMode,
    stream: StreamState,
    next_ticket: u64,
    abort: Option<CancellationToken>,
    outbound: VecDeque<MessageId>,
    flushing: bool,
}

/// One open conversation: its transcript, its history paginator and send state.
pub struct Session {
    id: SessionId,
    store: Arc<TranscriptStore>,
    paginator: HistoryPaginator,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn store(&self) -> &Arc<TranscriptStore> {
        &self.store
    }

    pub fn paginator(&self) -> &HistoryPaginator {
        &self.paginator
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> DeliveryMode {
        self.lock().mode
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().stream.is_streaming()
    }

    pub fn queued(&self) -> Vec<MessageId> {
        self.lock().outbound.iter().copied().collect()
    }

    fn begin_stream(&self) -> Option<(StreamTicket, CancellationToken)> {
        let mut state = self.lock();
        let ticket = StreamTicket(state.next_ticket);
        match state.stream.apply(StreamTransition::Start(ticket)) {
            Ok(next) => {
                state.stream = next;
                state.next_ticket += 1;
                let abort = CancellationToken::new();
                state.abort = Some(abort.clone());
                Some((ticket, abort))
            }
            Err(rejection) => {
                tracing::debug!(session_id = %self.id, ?rejection, "send rejected while streaming");
                None
            }
        }
    }

    fn finish_stream(&self, ticket: StreamTicket, outcome: Option<&IngestOutcome>) {
        let transition = match outcome {
            Some(IngestOutcome::Completed { .. }) => StreamTransition::Complete(ticket),
            Some(IngestOutcome::Failed { message, .. }) => StreamTransition::Fail {
                ticket,
                message: message.clone(),
            },
            Some(IngestOutcome::Aborted { .. }) | None => StreamTransition::Cancel(ticket),
        };

        let mut state = self.lock();
        match state.stream.apply(transition) {
            Ok(next) => state.stream = next,
            Err(rejection) => {
                tracing::warn!(session_id = %self.id, ?rejection, "stale stream transition ignored");
            }
        }
        state.abort = None;
    }

    fn take_outbound(&self) -> Option<Vec<MessageId>> {
        let mut state = self.lock();
        if state.flushing || state.outbound.is_empty() {
            return None;
        }
        state.flushing = true;
        Some(state.outbound.drain(..).collect())
    }

    fn end_flush(&self, requeue: &[MessageId]) {
        let mut state = self.lock();
        for id in requeue.iter().rev() {
            state.outbound.push_front(*id);
        }
        state.flushing = false;
    }
}

/// Owns every open session and routes sends through the backend.
pub struct SendCoordinator {
    backend: Arc<dyn ChatBackend>,
    blobs: Arc<dyn BlobStore>,
    settings: Arc<SyncSettings>,
    ingestor: StreamIngestor,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    notices: NoticeBoard,
}

impl SendCoordinator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        blobs: Arc<dyn BlobStore>,
        settings: Arc<SyncSettings>,
    ) -> SyncResult<Self> {
        let marker = UsageMarker::new(&settings.usage_marker_pattern)?;
        Ok(Self {
            backend,
            blobs,
            settings,
            ingestor: StreamIngestor::new(marker),
            sessions: Mutex::new(HashMap::new()),
            notices: NoticeBoard::new(),
        })
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the session, creating an empty one in the configured delivery mode.
    pub fn open_session(&self, session_id: SessionId) -> Arc<Session> {
        let mut sessions = self.sessions();
        sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                let store = Arc::new(TranscriptStore::new());
                tracing::info!(session_id = %session_id, "session opened");
                Arc::new(Session {
                    paginator: HistoryPaginator::new(
                        session_id.clone(),
                        self.backend.clone(),
                        store.clone(),
                        self.settings.page_size,
                    ),
                    id: session_id,
                    store,
                    state: Mutex::new(SessionState {
                        mode: self.settings.delivery_mode,
                        ..SessionState::default()
                    }),
                })
            })
            .clone()
    }

    pub fn session(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions().get(session_id).cloned()
    }

    pub fn close_session(&self, session_id: &SessionId) -> bool {
        let removed = self.sessions().remove(session_id);
        if let Some(session) = &removed
            && let Some(abort) = session.lock().abort.take()
        {
            abort.cancel();
        }
        removed.is_some()
    }

    fn require_session(
        &self,
        session_id: &SessionId,
        stage: &'static str,
    ) -> SyncResult<Arc<Session>> {
        self.session(session_id).ok_or_else(|| {
            SessionNotFoundSnafu {
                stage,
                session_id: session_id.to_string(),
            }
            .build()
        })
    }

    /// Switching is allowed only while nothing is streaming or queued.
    pub fn set_mode(&self, session_id: &SessionId, mode: DeliveryMode) -> SyncResult<()> {
        let session = self.require_session(session_id, "set-delivery-mode")?;
        let mut state = session.lock();
        if state.mode == mode {
            return Ok(());
        }
        if state.stream.is_streaming() || state.flushing || !state.outbound.is_empty() {
            return ModeSwitchRejectedSnafu {
                stage: "set-delivery-mode",
                details: format!(
                    "session {session_id} has {} queued message(s) or an active reply",
                    state.outbound.len()
                ),
            }
            .fail();
        }
        state.mode = mode;
        tracing::info!(session_id = %session_id, ?mode, "delivery mode changed");
        Ok(())
    }

    /// Cancels the active reply stream. Returns `false` when nothing is streaming.
    pub fn abort(&self, session_id: &SessionId) -> bool {
        let Some(session) = self.session(session_id) else {
            return false;
        };
        let abort = session.lock().abort.clone();
        match abort {
            Some(abort) => {
                abort.cancel();
                true
            }
            None => false,
        }
    }

    /// Inserts the user message optimistically, then streams the reply (immediate mode)
    /// or queues it for the next flush (batched mode).
    pub async fn compose(
        &self,
        session_id: &SessionId,
        content: MessageContent,
    ) -> SyncResult<ComposeOutcome> {
        let session = self.require_session(session_id, "compose")?;

        if session.mode() == DeliveryMode::Batched {
            let user_id = session.store.next_local_id();
            session.store.append(Message::user(user_id, content));
            session.lock().outbound.push_back(user_id);
            tracing::debug!(session_id = %session_id, message_id = %user_id, "message queued");
            return Ok(ComposeOutcome::Queued { user_id });
        }

        let Some((ticket, abort)) = session.begin_stream() else {
            return Ok(ComposeOutcome::Busy);
        };
        let user_id = session.store.next_local_id();
        session.store.append(Message::user(user_id, content));

        let (assistant_id, outcome) = self.stream_reply(&session, user_id, ticket, abort).await?;
        Ok(ComposeOutcome::Streamed {
            user_id,
            assistant_id,
            outcome,
        })
    }

    /// Sends every queued message as one request and inserts the reply turns one by one,
    /// `batch_stagger` apart.
    pub async fn flush(&self, session_id: &SessionId) -> SyncResult<FlushOutcome> {
        let session = self.require_session(session_id, "flush-batch")?;
        let Some(queued) = session.take_outbound() else {
            return Ok(FlushOutcome::default());
        };

        // Built from the store as it is now; queued messages deleted meanwhile are skipped.
        let mut parts = Vec::new();
        let mut sent = Vec::new();
        for id in queued {
            let Some(message) = session.store.get(id) else {
                tracing::debug!(session_id = %session_id, message_id = %id, "queued message removed before flush");
                continue;
            };
            parts.extend(wire_parts(&message.content, self.blobs.as_ref()).await);
            sent.push(id);
        }
        if sent.is_empty() {
            session.end_flush(&[]);
            return Ok(FlushOutcome::default());
        }

        let request =
            CompletionRequest::non_streaming(session_id.as_str(), WireContent::Parts(parts));
        let response = match self.backend.complete(request).await {
            Ok(response) => response,
            Err(error) => {
                session.end_flush(&sent);
                if error.kind() == FailureKind::AuthExpired {
                    self.notices
                        .post(session_id, NoticeKind::AuthExpired, error.to_string());
                    return Err(SyncError::from_backend("flush-batch", error));
                }
                self.notices
                    .post(session_id, NoticeKind::BatchFailed, error.to_string());
                return Ok(FlushOutcome {
                    sent: Vec::new(),
                    inserted: Vec::new(),
                    requeued: sent.len(),
                });
            }
        };

        // One backend user message may carry the whole batch.
        let echoed = response
            .messages
            .iter()
            .filter(|message| message.role == WireRole::User)
            .filter_map(|message| message.id)
            .collect::<Vec<_>>();
        for (index, id) in sent.iter().enumerate() {
            session
                .store
                .update(*id, MessagePatch::status(MessageStatus::Done));
            if let Some(remote) = echoed.get(index).or(echoed.last()) {
                session.store.link(*id, *remote);
            }
        }

        let turns = reply_turns(&response, &self.settings.batch_delimiter);
        let stagger = self.settings.batch_stagger();
        let mut inserted = Vec::with_capacity(turns.len());
        for (index, (remote, turn)) in turns.into_iter().enumerate() {
            if index > 0 {
                stagger_pause(stagger).await;
            }
            let id = session.store.next_local_id();
            let turn = Message::new(
                id,
                Role::Assistant,
                MessageContent::Text(turn),
                MessageStatus::Done,
            );
            session.store.append(match remote {
                Some(remote) => turn.with_remote(remote),
                None => turn,
            });
            inserted.push(id);
        }
        session.end_flush(&[]);

        tracing::info!(
            session_id = %session_id,
            sent = sent.len(),
            turns = inserted.len(),
            "batch flushed"
        );
        Ok(FlushOutcome {
            sent,
            inserted,
            requeued: 0,
        })
    }

    /// Replaces an assistant reply with a fresh one for the nearest preceding user message.
    pub async fn regenerate(
        &self,
        session_id: &SessionId,
        assistant_id: MessageId,
    ) -> SyncResult<ComposeOutcome> {
        let session = self.require_session(session_id, "regenerate")?;
        let stale = session.store.get(assistant_id).ok_or_else(|| {
            MessageNotFoundSnafu {
                stage: "regenerate",
                message_id: assistant_id.to_string(),
            }
            .build()
        })?;
        if stale.role != Role::Assistant {
            return NotAnAssistantReplySnafu {
                stage: "regenerate",
                message_id: assistant_id.to_string(),
            }
            .fail();
        }
        let Some(user) = session.store.preceding(assistant_id, Role::User) else {
            return NoPrecedingUserMessageSnafu {
                stage: "regenerate",
                message_id: assistant_id.to_string(),
            }
            .fail();
        };

        let Some((ticket, abort)) = session.begin_stream() else {
            return Ok(ComposeOutcome::Busy);
        };
        let remote = match self.resolve_backend_id(&session, &stale).await {
            Ok(remote) => remote,
            Err(error) => {
                session.finish_stream(ticket, None);
                return Err(error);
            }
        };
        session.store.remove(assistant_id);
        remove_backed_by(&session, remote);

        match remote {
            Some(server_id) => {
                let deleted = self
                    .backend
                    .delete_message(session_id.as_str(), server_id)
                    .await;
                if let Err(error) = deleted {
                    if error.kind() == FailureKind::AuthExpired {
                        session.finish_stream(ticket, None);
                        self.notices
                            .post(session_id, NoticeKind::AuthExpired, error.to_string());
                        return Err(SyncError::from_backend("regenerate-delete", error));
                    }
                    self.notices
                        .post(session_id, NoticeKind::DeleteFailed, error.to_string());
                }
            }
            None => {
                tracing::debug!(
                    session_id = %session_id,
                    message_id = %assistant_id,
                    "local reply has no backend copy to delete"
                );
            }
        }

        let (assistant_id, outcome) = self.stream_reply(&session, user.id, ticket, abort).await?;
        Ok(ComposeOutcome::Streamed {
            user_id: user.id,
            assistant_id,
            outcome,
        })
    }

    /// Removes a message locally and, when the backend has a copy, on the backend too.
    /// Local messages split from the same backend message go with it.
    pub async fn delete_message(
        &self,
        session_id: &SessionId,
        message_id: MessageId,
    ) -> SyncResult<Message> {
        let session = self.require_session(session_id, "delete-message")?;
        let missing = || {
            MessageNotFoundSnafu {
                stage: "delete-message",
                message_id: message_id.to_string(),
            }
            .build()
        };
        let target = session.store.get(message_id).ok_or_else(missing)?;
        let remote = self.resolve_backend_id(&session, &target).await?;
        let removed = session.store.remove(message_id).ok_or_else(missing)?;
        session.lock().outbound.retain(|id| *id != message_id);
        remove_backed_by(&session, remote);

        if let Some(server_id) = remote
            && let Err(error) = self
                .backend
                .delete_message(session_id.as_str(), server_id)
                .await
        {
            if error.kind() == FailureKind::AuthExpired {
                self.notices
                    .post(session_id, NoticeKind::AuthExpired, error.to_string());
                return Err(SyncError::from_backend("delete-message", error));
            }
            self.notices
                .post(session_id, NoticeKind::DeleteFailed, error.to_string());
        }
        Ok(removed)
    }

    /// Backend id of `message`. A settled local message without one is looked up in the
    /// newest history page first.
    async fn resolve_backend_id(
        &self,
        session: &Session,
        message: &Message,
    ) -> SyncResult<Option<u64>> {
        if let Some(remote) = message.backend_id() {
            return Ok(Some(remote));
        }
        if message.status != MessageStatus::Done {
            return Ok(None);
        }
        self.reconcile(session).await?;
        Ok(session
            .store
            .get(message.id)
            .and_then(|message| message.backend_id()))
    }

    /// Refreshes the newest history page so local messages pick up their server copies.
    /// Only an expired credential is an error.
    async fn reconcile(&self, session: &Session) -> SyncResult<()> {
        match session.paginator.reconcile().await {
            Ok(Some(page)) => {
                tracing::debug!(session_id = %session.id, linked = page.linked, inserted = page.inserted, "transcript reconciled");
                Ok(())
            }
            Ok(None) => {
                tracing::debug!(session_id = %session.id, "reconcile skipped while a page loads");
                Ok(())
            }
            Err(error) if error.is_auth_expired() => {
                self.notices
                    .post(&session.id, NoticeKind::AuthExpired, error.to_string());
                Err(error)
            }
            Err(error) => {
                tracing::warn!(session_id = %session.id, %error, "reconcile failed");
                Ok(())
            }
        }
    }

    async fn stream_reply(
        &self,
        session: &Session,
        user_id: MessageId,
        ticket: StreamTicket,
        abort: CancellationToken,
    ) -> SyncResult<(MessageId, IngestOutcome)> {
        // Re-read: the user message may have changed or vanished while we were suspended.
        let Some(user) = session.store.get(user_id) else {
            session.finish_stream(ticket, None);
            return MessageNotFoundSnafu {
                stage: "stream-reply",
                message_id: user_id.to_string(),
            }
            .fail();
        };

        let payload = build_payload(&user.content, self.blobs.as_ref()).await;
        let request = CompletionRequest::streaming(session.id.as_str(), payload);
        let assistant_id = session.store.next_reply_id(user_id);
        // Sent from here on, whatever the reply does.
        session
            .store
            .update(user_id, MessagePatch::status(MessageStatus::Done));
        let session_id = session.id.clone();
        let outcome = self
            .ingestor
            .consume(
                self.backend.as_ref(),
                request,
                &session.store,
                assistant_id,
                &abort,
                |_, accumulated| {
                    tracing::trace!(session_id = %session_id, chars = accumulated.len(), "reply delta");
                },
            )
            .await;
        session.finish_stream(ticket, Some(&outcome));

        match &outcome {
            IngestOutcome::Completed { .. } => {
                if let Err(error) = self.reconcile(session).await {
                    tracing::warn!(session_id = %session.id, %error, "reply kept without a server id");
                }
            }
            IngestOutcome::Aborted { .. } => {}
            IngestOutcome::Failed { kind, message, .. } => {
                self.notices
                    .post(&session.id, NoticeKind::from(*kind), message.clone());
                if *kind == FailureKind::AuthExpired {
                    return Err(SyncError::AuthExpired {
                        stage: "stream-reply",
                        details: message.clone(),
                    });
                }
            }
        }
        Ok((assistant_id, outcome))
    }
}

/// Assistant text of a batched response split on `delimiter`, blank segments dropped.
pub fn split_turns(response: &CompletionResponse, delimiter: &str) -> Vec<String> {
    reply_turns(response, delimiter)
        .into_iter()
        .map(|(_, turn)| turn)
        .collect()
}

/// Reply turns paired with the id of the backend message they were split from.
fn reply_turns(response: &CompletionResponse, delimiter: &str) -> Vec<(Option<u64>, String)> {
    response
        .messages
        .iter()
        .filter(|message| message.role == WireRole::Assistant)
        .flat_map(|message| {
            message
                .content
                .text()
                .split(delimiter)
                .map(|segment| (message.id, segment.trim().to_string()))
                .collect::<Vec<_>>()
        })
        .filter(|(_, segment)| !segment.is_empty())
        .collect()
}

fn remove_backed_by(session: &Session, remote: Option<u64>) {
    let Some(remote) = remote else {
        return;
    };
    let siblings = session.store.backed_by(remote);
    if siblings.is_empty() {
        return;
    }
    for id in &siblings {
        session.store.remove(*id);
    }
    session.lock().outbound.retain(|id| !siblings.contains(id));
}

async fn stagger_pause(stagger: Duration) {
    if !stagger.is_zero() {
        tokio::time::sleep(stagger).await;
    }
}

#[cfg(test)]
mod tests {
    use zova_client::wire::WireMessage;

    use super::*;

    fn assistant(text: &str) -> WireMessage {
        WireMessage {
            id: None,
            role: WireRole::Assistant,
            content: WireContent::Text(text.to_string()),
            created_at: None,
        }
    }

    #[test]
    fn split_turns_drops_blank_segments() {
        let response = CompletionResponse {
            messages: vec![
                assistant("first<|split|>  <|split|>second"),
                WireMessage {
                    role: WireRole::User,
                    ..assistant("echo")
                },
                assistant("third"),
            ],
        };

        assert_eq!(
            split_turns(&response, "<|split|>"),
            vec!["first".to_string(), "second".to_string(), "third".to_string()]
        );
    }

    #[test]
    fn reply_turns_keep_the_backend_id_they_came_from() {
        let response = CompletionResponse {
            messages: vec![
                WireMessage {
                    id: Some(7),
                    ..assistant("a<|split|>b")
                },
                assistant("c"),
            ],
        };

        assert_eq!(
            reply_turns(&response, "<|split|>"),
            vec![
                (Some(7), "a".to_string()),
                (Some(7), "b".to_string()),
                (None, "c".to_string()),
            ]
        );
    }

    #[test]
    fn split_turns_of_empty_response_is_empty() {
        assert!(split_turns(&CompletionResponse::default(), "<|split|>").is_empty());
    }
}
