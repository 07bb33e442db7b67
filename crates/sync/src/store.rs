use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::ids::{LocalId, MessageId};
use crate::message::{Message, MessagePatch, MessageStatus, Role};

const EVENT_CAPACITY: usize = 256;

/// Change notifications for subscribers that re-render on mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    Appended(MessageId),
    Prepended { count: usize },
    Replaced { count: usize },
    /// Newer server messages merged in by a refresh.
    Merged { count: usize },
    Updated(MessageId),
    Removed(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    Missing,
    Frozen,
}

/// What a history page did to the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    pub inserted: usize,
    /// Local messages found in the page and linked to their server copy.
    pub linked: usize,
}

#[derive(Default)]
struct StoreState {
    messages: Vec<Message>,
    next_local_seq: u64,
}

impl StoreState {
    fn position(&self, id: MessageId) -> Option<usize> {
        self.messages.binary_search_by(|message| message.id.cmp(&id)).ok()
    }

    fn backend_ids(&self) -> HashSet<u64> {
        self.messages.iter().filter_map(Message::backend_id).collect()
    }

    /// Inserts unknown page messages. A page message newer than everything the backend
    /// had given us before is first matched against settled local messages: a user
    /// message by its text, an assistant message as the reply right behind a user
    /// message matched just before it.
    fn merge(&mut self, page: Vec<Message>) -> (MergeOutcome, Vec<MessageId>) {
        let known = self.backend_ids();
        let latest_known = known.iter().max().copied();
        let mut fresh = dedup_sorted(page, &known);
        let mut linked = Vec::new();
        let mut matched_user: Option<usize> = None;

        fresh.retain(|candidate| {
            let Some(remote) = candidate.id.server() else {
                return true;
            };
            if latest_known.is_some_and(|latest| remote <= latest) {
                matched_user = None;
                return true;
            }
            let slot = match candidate.role {
                Role::User => self.unlinked_user_with_text(&candidate.content.text()),
                Role::Assistant => matched_user.and_then(|user| self.unlinked_reply_after(user)),
                Role::System => None,
            };
            let Some(index) = slot else {
                matched_user = None;
                return true;
            };

            let local = &mut self.messages[index];
            local.remote = Some(remote);
            linked.push(local.id);
            matched_user = (candidate.role == Role::User).then_some(index);
            false
        });

        let inserted = fresh.len();
        if inserted > 0 {
            self.messages.extend(fresh);
            self.messages.sort_by_key(|message| message.id);
        }
        let outcome = MergeOutcome {
            inserted,
            linked: linked.len(),
        };
        (outcome, linked)
    }

    fn is_linkable(message: &Message, role: Role) -> bool {
        message.role == role
            && message.id.is_local()
            && message.remote.is_none()
            && message.status == MessageStatus::Done
    }

    fn unlinked_user_with_text(&self, text: &str) -> Option<usize> {
        self.messages.iter().position(|message| {
            Self::is_linkable(message, Role::User) && message.content.text().trim() == text.trim()
        })
    }

    fn unlinked_reply_after(&self, user: usize) -> Option<usize> {
        self.messages[user + 1..]
            .iter()
            .take_while(|message| message.role != Role::User)
            .position(|message| Self::is_linkable(message, Role::Assistant))
            .map(|offset| user + 1 + offset)
    }
}

/// Ordered, duplicate-free transcript of one session.
///
/// Every mutation takes the lock briefly and never across an await, so async flows
/// re-read the store after each suspension instead of trusting earlier snapshots.
pub struct TranscriptStore {
    state: Mutex<StoreState>,
    events: broadcast::Sender<TranscriptEvent>,
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(StoreState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: TranscriptEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Inserts at the position its id sorts to. Returns `false` for a duplicate id.
    pub fn append(&self, message: Message) -> bool {
        let id = message.id;
        {
            let mut state = self.lock();
            let index = match state
                .messages
                .binary_search_by(|existing| existing.id.cmp(&id))
            {
                Ok(_) => {
                    tracing::debug!(message_id = %id, "ignored duplicate append");
                    return false;
                }
                Err(index) => index,
            };
            state.messages.insert(index, message);
        }
        self.notify(TranscriptEvent::Appended(id));
        true
    }

    /// Prepends an older page, skipping ids already present. Returns how many were inserted.
    pub fn insert_at_head(&self, page: Vec<Message>) -> usize {
        let inserted = {
            let mut state = self.lock();
            let known = state.backend_ids();
            let fresh = dedup_sorted(page, &known);
            let inserted = fresh.len();
            if inserted == 0 {
                return 0;
            }

            let tail = std::mem::take(&mut state.messages);
            let mut merged = fresh;
            let needs_sort = matches!(
                (merged.last(), tail.first()),
                (Some(last), Some(first)) if last.id > first.id
            );
            merged.extend(tail);
            if needs_sort {
                merged.sort_by_key(|message| message.id);
            }
            state.messages = merged;
            inserted
        };
        self.notify(TranscriptEvent::Prepended { count: inserted });
        inserted
    }

    /// Replaces the loaded history with `page`. Local messages are kept where they
    /// sort; those the page already carries are linked instead of duplicated.
    pub fn replace_history(&self, page: Vec<Message>) -> MergeOutcome {
        let (outcome, linked, count) = {
            let mut state = self.lock();
            state.messages.retain(|message| message.id.is_local());
            let (outcome, linked) = state.merge(page);
            (outcome, linked, state.messages.len())
        };
        for id in linked {
            self.notify(TranscriptEvent::Updated(id));
        }
        self.notify(TranscriptEvent::Replaced { count });
        outcome
    }

    /// Merges the newest page into what is loaded, dropping nothing.
    pub fn merge_latest(&self, page: Vec<Message>) -> MergeOutcome {
        let (outcome, linked) = self.lock().merge(page);
        for id in linked {
            self.notify(TranscriptEvent::Updated(id));
        }
        if outcome.inserted > 0 {
            self.notify(TranscriptEvent::Merged {
                count: outcome.inserted,
            });
        }
        outcome
    }

    /// Records the server copy of a local message.
    pub fn link(&self, id: MessageId, remote: u64) -> bool {
        {
            let mut state = self.lock();
            let Some(index) = state.position(id) else {
                return false;
            };
            state.messages[index].remote = Some(remote);
        }
        self.notify(TranscriptEvent::Updated(id));
        true
    }

    /// Every message backed by server message `remote`.
    pub fn backed_by(&self, remote: u64) -> Vec<MessageId> {
        self.lock()
            .messages
            .iter()
            .filter(|message| message.backend_id() == Some(remote))
            .map(|message| message.id)
            .collect()
    }

    pub fn replace_all(&self, messages: Vec<Message>) {
        let count = {
            let mut state = self.lock();
            state.messages = dedup_sorted(messages, &HashSet::new());
            state.messages.len()
        };
        self.notify(TranscriptEvent::Replaced { count });
    }

    /// Applies a partial update. Frozen messages reject every patch.
    pub fn update(&self, id: MessageId, patch: MessagePatch) -> UpdateOutcome {
        {
            let mut state = self.lock();
            let Some(index) = state.position(id) else {
                return UpdateOutcome::Missing;
            };
            let message = &mut state.messages[index];
            if message.status.is_frozen() {
                tracing::debug!(message_id = %id, status = ?message.status, "rejected patch on frozen message");
                return UpdateOutcome::Frozen;
            }
            if let Some(content) = patch.content {
                message.content = content;
            }
            if let Some(status) = patch.status {
                message.status = status;
            }
        }
        self.notify(TranscriptEvent::Updated(id));
        UpdateOutcome::Applied
    }

    pub fn remove(&self, id: MessageId) -> Option<Message> {
        let removed = {
            let mut state = self.lock();
            let index = state.position(id)?;
            state.messages.remove(index)
        };
        self.notify(TranscriptEvent::Removed(id));
        Some(removed)
    }

    pub fn get(&self, id: MessageId) -> Option<Message> {
        let state = self.lock();
        state.position(id).map(|index| state.messages[index].clone())
    }

    pub fn all(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.lock().messages.iter().map(|message| message.id).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    /// Smallest id the backend knows; pagination continues strictly below it.
    pub fn cursor(&self) -> Option<u64> {
        self.lock().backend_ids().into_iter().min()
    }

    pub fn latest_server_id(&self) -> Option<u64> {
        self.lock().backend_ids().into_iter().max()
    }

    /// Mints a local id that sorts at the tail of the transcript.
    pub fn next_local_id(&self) -> MessageId {
        let mut state = self.lock();
        let after = state
            .messages
            .last()
            .map(|message| message.id.anchor())
            .unwrap_or(LocalId::UNPLACED);
        state.next_local_seq += 1;
        MessageId::Local(LocalId {
            after,
            seq: state.next_local_seq,
            reply: 0,
        })
    }

    /// Mints an id that sorts directly behind `parent` and ahead of anything composed
    /// after it.
    pub fn next_reply_id(&self, parent: MessageId) -> MessageId {
        let mut state = self.lock();
        state.next_local_seq += 1;
        let reply = state.next_local_seq;
        MessageId::Local(match parent {
            MessageId::Local(local) => LocalId { reply, ..local },
            MessageId::Server(id) => LocalId {
                after: id,
                seq: 0,
                reply,
            },
        })
    }

    /// Nearest message with `role` strictly before `id`.
    pub fn preceding(&self, id: MessageId, role: Role) -> Option<Message> {
        let state = self.lock();
        let index = state.position(id)?;
        state.messages[..index]
            .iter()
            .rev()
            .find(|message| message.role == role)
            .cloned()
    }
}

fn dedup_sorted(mut messages: Vec<Message>, known: &HashSet<u64>) -> Vec<Message> {
    let mut seen = HashSet::with_capacity(messages.len());
    messages.retain(|message| {
        let backed = message
            .backend_id()
            .is_some_and(|backend_id| known.contains(&backend_id));
        !backed && seen.insert(message.id)
    });
    messages.sort_by_key(|message| message.id);
    messages
}
