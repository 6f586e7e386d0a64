//! Bearer token supply.
//!
//! Token acquisition belongs to the host application; the access layer only
//! asks for the current token each time it sends a request.

use async_trait::async_trait;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current bearer token, or `None` for anonymous requests.
    async fn bearer_token(&self) -> Option<String>;
}

/// A fixed token, set once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}
