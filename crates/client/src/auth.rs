use crate::backend::BoxFuture;
use crate::error::BackendResult;

/// Supplies bearer credentials. Requests call `reauthenticate` at most once after a 401.
pub trait AuthProvider: Send + Sync {
    fn credential<'a>(&'a self) -> BoxFuture<'a, BackendResult<String>>;
    fn reauthenticate<'a>(&'a self) -> BoxFuture<'a, BackendResult<String>>;
}

/// Fixed token; re-authentication hands back the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into().trim().to_string(),
        }
    }
}

impl AuthProvider for StaticToken {
    fn credential<'a>(&'a self) -> BoxFuture<'a, BackendResult<String>> {
        Box::pin(async move { Ok(self.token.clone()) })
    }

    fn reauthenticate<'a>(&'a self) -> BoxFuture<'a, BackendResult<String>> {
        Box::pin(async move { Ok(self.token.clone()) })
    }
}
