use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use zova_client::ChatBackend;
use zova_client::wire::HistoryQuery;

use crate::convert::message_from_wire;
use crate::error::{SyncError, SyncResult};
use crate::ids::SessionId;
use crate::scroll::{ScrollAnchor, Viewport};
use crate::store::{MergeOutcome, TranscriptStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOutcome {
    pub inserted: usize,
    /// Local messages recognised in the page.
    pub linked: usize,
    pub has_more: bool,
    /// The page replaced the loaded history instead of extending it.
    pub replaced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageMode {
    Newest,
    Older(u64),
    Refresh,
}

impl From<Option<u64>> for PageMode {
    fn from(before: Option<u64>) -> Self {
        before.map_or(Self::Newest, Self::Older)
    }
}

impl PageMode {
    fn before(self) -> Option<u64> {
        match self {
            Self::Older(before) => Some(before),
            Self::Newest | Self::Refresh => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PageCursor {
    loaded_once: bool,
    has_more: bool,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Loads history pages for one session. At most one fetch is in flight; triggers that
/// arrive while one is running are dropped, not queued.
pub struct HistoryPaginator {
    session_id: SessionId,
    backend: Arc<dyn ChatBackend>,
    store: Arc<TranscriptStore>,
    page_size: usize,
    busy: AtomicBool,
    cursor: Mutex<PageCursor>,
}

impl HistoryPaginator {
    pub fn new(
        session_id: SessionId,
        backend: Arc<dyn ChatBackend>,
        store: Arc<TranscriptStore>,
        page_size: usize,
    ) -> Self {
        Self {
            session_id,
            backend,
            store,
            page_size: page_size.max(1),
            busy: AtomicBool::new(false),
            cursor: Mutex::new(PageCursor::default()),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Whether the server reported older messages; `true` until the first page lands.
    pub fn has_more(&self) -> bool {
        let cursor = self.cursor_state();
        !cursor.loaded_once || cursor.has_more
    }

    fn cursor_state(&self) -> PageCursor {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_begin(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(&self.busy))
    }

    /// Fetches one page. `before = None` loads the newest page and replaces the loaded
    /// history, keeping local messages; otherwise the page is merged at the head.
    /// `Ok(None)` means the call was dropped because another fetch is in flight.
    pub async fn fetch_page(&self, before: Option<u64>) -> SyncResult<Option<PageOutcome>> {
        self.fetch_with(PageMode::from(before), |_| {}).await
    }

    /// Merges the newest page without dropping anything loaded, linking local messages
    /// whose server copies it carries.
    pub async fn reconcile(&self) -> SyncResult<Option<PageOutcome>> {
        self.fetch_with(PageMode::Refresh, |_| {}).await
    }

    pub async fn load_latest(&self) -> SyncResult<Option<PageOutcome>> {
        self.fetch_page(None).await
    }

    /// Continues from the store's cursor, or loads the newest page when nothing is loaded.
    pub async fn load_older(&self) -> SyncResult<Option<PageOutcome>> {
        match self.next_cursor() {
            Some(before) => self.fetch_page(before).await,
            None => Ok(None),
        }
    }

    /// Like `load_older`, capturing scroll geometry right before the store mutates so
    /// the next layout can restore the viewport.
    pub async fn load_older_anchored(
        &self,
        viewport: &dyn Viewport,
        anchor: &mut ScrollAnchor,
    ) -> SyncResult<Option<PageOutcome>> {
        let Some(before) = self.next_cursor() else {
            return Ok(None);
        };
        self.fetch_with(PageMode::from(before), |replacing| {
            if replacing {
                anchor.defer_scroll_to_end();
            } else {
                anchor.capture(viewport);
            }
        })
        .await
    }

    /// `None` when there is nothing left to load; `Some(None)` for the newest page.
    fn next_cursor(&self) -> Option<Option<u64>> {
        let cursor = self.cursor_state();
        match self.store.cursor() {
            Some(_) if cursor.loaded_once && !cursor.has_more => {
                tracing::debug!(session_id = %self.session_id, "history exhausted");
                None
            }
            Some(before) => Some(Some(before)),
            None if cursor.loaded_once && !cursor.has_more => None,
            None => Some(None),
        }
    }

    async fn fetch_with<F>(&self, mode: PageMode, before_apply: F) -> SyncResult<Option<PageOutcome>>
    where
        F: FnOnce(bool),
    {
        let before = mode.before();
        let Some(_busy) = self.try_begin() else {
            tracing::debug!(
                session_id = %self.session_id,
                ?before,
                "dropped history trigger while a fetch is in flight"
            );
            return Ok(None);
        };

        let query = HistoryQuery {
            limit: self.page_size,
            before_id: before,
        };
        let page = self
            .backend
            .fetch_history(self.session_id.as_str(), query)
            .await
            .map_err(|source| SyncError::from_backend("fetch-history-page", source))?;

        let has_more = page.has_more;
        let messages = page
            .messages
            .into_iter()
            .filter_map(message_from_wire)
            .collect::<Vec<_>>();

        let page_oldest = messages.iter().filter_map(|message| message.id.server()).min();
        let loaded_oldest = self.store.cursor();

        let replacing = mode == PageMode::Newest;
        before_apply(replacing);
        let merged = match mode {
            PageMode::Newest => self.store.replace_history(messages),
            PageMode::Older(_) => MergeOutcome {
                inserted: self.store.insert_at_head(messages),
                linked: 0,
            },
            PageMode::Refresh => self.store.merge_latest(messages),
        };

        {
            let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
            // A refresh only speaks for older history when it reaches what is loaded.
            let reaches_loaded = match (page_oldest, loaded_oldest) {
                (_, None) => true,
                (Some(page), Some(loaded)) => page <= loaded,
                (None, Some(_)) => false,
            };
            if mode != PageMode::Refresh || !cursor.loaded_once || reaches_loaded {
                cursor.has_more = has_more;
            }
            cursor.loaded_once = true;
        }

        tracing::info!(
            session_id = %self.session_id,
            ?mode,
            inserted = merged.inserted,
            linked = merged.linked,
            has_more,
            "history page applied"
        );
        Ok(Some(PageOutcome {
            inserted: merged.inserted,
            linked: merged.linked,
            has_more,
            replaced: replacing,
        }))
    }
}
