use snafu::Snafu;
use zova_client::{BackendError, FailureKind};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("backend call failed on `{stage}`: {source}"))]
    Backend {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("credential expired on `{stage}`: {details}"))]
    AuthExpired {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("session '{session_id}' is not open"))]
    SessionNotFound {
        stage: &'static str,
        session_id: String,
    },
    #[snafu(display("message '{message_id}' is not in the transcript"))]
    MessageNotFound {
        stage: &'static str,
        message_id: String,
    },
    #[snafu(display("message '{message_id}' is not an assistant reply"))]
    NotAnAssistantReply {
        stage: &'static str,
        message_id: String,
    },
    #[snafu(display("no user message precedes '{message_id}'"))]
    NoPrecedingUserMessage {
        stage: &'static str,
        message_id: String,
    },
    #[snafu(display("cannot switch delivery mode on `{stage}`: {details}"))]
    ModeSwitchRejected {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("usage marker pattern '{pattern}' is invalid: {source}"))]
    InvalidMarkerPattern {
        stage: &'static str,
        pattern: String,
        source: regex::Error,
    },
}

impl SyncError {
    /// Backend failures promoted to `AuthExpired` so callers see one fatal variant.
    pub(crate) fn from_backend(stage: &'static str, source: BackendError) -> Self {
        if source.kind() == FailureKind::AuthExpired {
            Self::AuthExpired {
                stage,
                details: source.to_string(),
            }
        } else {
            Self::Backend { stage, source }
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired { .. })
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
