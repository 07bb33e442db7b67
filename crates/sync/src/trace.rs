//! Live reconstruction of request traces pushed by the server.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use zova_client::wire::{WireBlockType, WireTraceEvent};
use zova_client::{TraceFeed, TraceFeedItem};

use crate::ids::RequestId;

const UPDATE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Thinking,
    Text,
    ToolUse,
    ToolResult,
}

impl From<WireBlockType> for BlockType {
    fn from(value: WireBlockType) -> Self {
        match value {
            WireBlockType::Thinking => Self::Thinking,
            WireBlockType::Text => Self::Text,
            WireBlockType::ToolUse => Self::ToolUse,
            WireBlockType::ToolResult => Self::ToolResult,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub block_type: BlockType,
    pub content: String,
    pub tool_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    pub index: u32,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceItem {
    pub request_id: RequestId,
    pub rounds: Vec<Round>,
    /// Set from the first block until the request's `done` arrives.
    pub live: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Block {
        request_id: RequestId,
        round_index: u32,
        block: Block,
    },
    Done {
        request_id: RequestId,
    },
}

impl From<WireTraceEvent> for TraceEvent {
    fn from(value: WireTraceEvent) -> Self {
        match value {
            WireTraceEvent::Block(block) => Self::Block {
                request_id: RequestId::new(block.request_id),
                round_index: block.round_index,
                block: Block {
                    block_type: block.block_type.into(),
                    content: block.content,
                    tool_name: block.tool_name,
                },
            },
            WireTraceEvent::Done(done) => Self::Done {
                request_id: RequestId::new(done.request_id),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u64, retry_in: Duration },
    Stopped(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraceUpdate {
    BlockAppended {
        request_id: RequestId,
        round_index: u32,
        created: bool,
    },
    Finished {
        request_id: RequestId,
        created: bool,
    },
    Status(ChannelStatus),
}

/// Trace items, newest request first.
#[derive(Debug, Clone, Default)]
pub struct TraceLog {
    items: Vec<TraceItem>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[TraceItem] {
        &self.items
    }

    pub fn get(&self, request_id: &RequestId) -> Option<&TraceItem> {
        self.items.iter().find(|item| &item.request_id == request_id)
    }

    pub fn is_live(&self, request_id: &RequestId) -> bool {
        self.get(request_id).is_some_and(|item| item.live)
    }

    fn find_or_create(&mut self, request_id: &RequestId, live: bool) -> (&mut TraceItem, bool) {
        match self.items.iter().position(|item| &item.request_id == request_id) {
            Some(index) => (&mut self.items[index], false),
            None => {
                self.items.insert(
                    0,
                    TraceItem {
                        request_id: request_id.clone(),
                        rounds: Vec::new(),
                        live,
                    },
                );
                (&mut self.items[0], true)
            }
        }
    }

    pub fn apply(&mut self, event: TraceEvent) -> TraceUpdate {
        match event {
            TraceEvent::Block {
                request_id,
                round_index,
                block,
            } => {
                let (item, created) = self.find_or_create(&request_id, true);
                match item.rounds.iter_mut().find(|round| round.index == round_index) {
                    Some(round) => round.blocks.push(block),
                    None => {
                        item.rounds.push(Round {
                            index: round_index,
                            blocks: vec![block],
                        });
                        item.rounds.sort_by_key(|round| round.index);
                    }
                }
                TraceUpdate::BlockAppended {
                    request_id,
                    round_index,
                    created,
                }
            }
            TraceEvent::Done { request_id } => {
                let (item, created) = self.find_or_create(&request_id, false);
                item.live = false;
                TraceUpdate::Finished {
                    request_id,
                    created,
                }
            }
        }
    }
}

/// Shared `TraceLog` fed from the push channel; subscribers get every update.
pub struct LiveTraceReconstructor {
    log: Mutex<TraceLog>,
    status: Mutex<ChannelStatus>,
    updates: broadcast::Sender<TraceUpdate>,
}

impl Default for LiveTraceReconstructor {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveTraceReconstructor {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            log: Mutex::new(TraceLog::new()),
            status: Mutex::new(ChannelStatus::Connecting),
            updates,
        }
    }

    fn log(&self) -> MutexGuard<'_, TraceLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraceUpdate> {
        self.updates.subscribe()
    }

    pub fn apply(&self, event: TraceEvent) -> TraceUpdate {
        let update = self.log().apply(event);
        let _ = self.updates.send(update.clone());
        update
    }

    pub fn snapshot(&self) -> Vec<TraceItem> {
        self.log().items().to_vec()
    }

    pub fn item(&self, request_id: &RequestId) -> Option<TraceItem> {
        self.log().get(request_id).cloned()
    }

    pub fn is_live(&self, request_id: &RequestId) -> bool {
        self.log().is_live(request_id)
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_status(&self, status: ChannelStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status.clone();
        let _ = self.updates.send(TraceUpdate::Status(status));
    }

    /// Drains `feed` until it ends or reports a fatal error.
    pub async fn run(&self, mut feed: TraceFeed) {
        while let Some(item) = feed.recv().await {
            match item {
                TraceFeedItem::Connected => self.set_status(ChannelStatus::Connected),
                TraceFeedItem::Event(event) => {
                    self.apply(event.into());
                }
                TraceFeedItem::Disconnected { attempt, retry_in } => {
                    self.set_status(ChannelStatus::Reconnecting { attempt, retry_in });
                }
                TraceFeedItem::Fatal(message) => {
                    self.set_status(ChannelStatus::Stopped(message));
                    return;
                }
            }
        }
        self.set_status(ChannelStatus::Stopped("trace feed closed".to_string()));
    }
}
