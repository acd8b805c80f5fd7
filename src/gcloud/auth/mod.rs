//! Authorization logic.

pub mod config_helper;
pub mod interceptor;
pub mod revocation;
pub mod token_manager;

#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    type Token: Token;
    type Error: Send + Sync;

    async fn get_auth_token(&self) -> Result<Self::Token, Self::Error>;
}

pub trait Token: Send {
    fn access_token(&self) -> &str;

    /// The account the token was issued to, when the provider knows it.
    fn account(&self) -> Option<&str> {
        None
    }
}

pub trait ExpiringToken: Token {
    fn expires_at(&self) -> tokio::time::Instant;
}

/// Classifies provider failures that may go away on their own, such as the
/// token endpoint being unreachable.
pub trait TransientError {
    fn is_transient(&self) -> bool;
}

/// Invalidates a token with the issuing authority.
#[async_trait::async_trait]
pub trait Revoker: Send + Sync {
    type Error: Send + Sync;

    async fn revoke(&self, access_token: &str, account: &str) -> Result<(), Self::Error>;
}
