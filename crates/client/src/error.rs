use snafu::Snafu;

/// Coarse failure classes the sync engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connection never completed or was reset mid-flight.
    Network,
    /// The peer answered with something that is not the agreed wire format.
    Protocol,
    /// Re-authentication was attempted once and the retry was still rejected.
    AuthExpired,
    /// Non-success HTTP status other than 401.
    Status(u16),
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("endpoint returned status {status} on `{stage}`: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("credential rejected after re-authentication on `{stage}`"))]
    AuthExpired { stage: &'static str },
    #[snafu(display("re-authentication failed on `{stage}`: {details}"))]
    Authenticate {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to read response body on `{stage}`: {source}"))]
    ReadBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to decode payload on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("completion request for session '{session_id}' has an empty message"))]
    EmptyMessage {
        stage: &'static str,
        session_id: String,
    },
    #[snafu(display("stream ended before the terminal sentinel on `{stage}`"))]
    StreamEnded { stage: &'static str },
}

impl BackendError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::BuildClient { .. } | Self::Request { .. } | Self::StreamEnded { .. } => {
                FailureKind::Network
            }
            Self::ReadBody { .. } | Self::Decode { .. } | Self::EmptyMessage { .. } => {
                FailureKind::Protocol
            }
            Self::AuthExpired { .. } | Self::Authenticate { .. } => FailureKind::AuthExpired,
            Self::Status { status, .. } => FailureKind::Status(*status),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
