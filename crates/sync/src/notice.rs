use tokio::sync::broadcast;
use zova_client::FailureKind;

use crate::ids::SessionId;

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    NetworkFailure,
    /// The backend answered, but with an error status or an unreadable reply.
    RequestFailed,
    AuthExpired,
    DeleteFailed,
    BatchFailed,
}

impl From<FailureKind> for NoticeKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Network => Self::NetworkFailure,
            FailureKind::Protocol | FailureKind::Status(_) => Self::RequestFailed,
            FailureKind::AuthExpired => Self::AuthExpired,
        }
    }
}

/// Transient, user-visible failure report. Notices never remove transcript content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub session_id: SessionId,
    pub kind: NoticeKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct NoticeBoard {
    sender: broadcast::Sender<Notice>,
}

impl Default for NoticeBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeBoard {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    pub fn post(&self, session_id: &SessionId, kind: NoticeKind, message: impl Into<String>) {
        let notice = Notice {
            session_id: session_id.clone(),
            kind,
            message: message.into(),
        };
        tracing::warn!(session_id = %notice.session_id, kind = ?notice.kind, message = %notice.message, "notice");
        let _ = self.sender.send(notice);
    }
}
