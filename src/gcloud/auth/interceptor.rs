//! Attach bearer tokens to outgoing requests and recover from 401 responses.

use reqwest::{
    header::{HeaderValue, InvalidHeaderValue, AUTHORIZATION},
    StatusCode,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    token_manager::{self, TokenManager},
    ExpiringToken, Revoker, TokenProvider, TransientError,
};

/// Nominal account handed to the revoker when the token does not name one.
pub const DEFAULT_ACCOUNT: &str = "user";

#[derive(Debug, thiserror::Error)]
pub enum Error<RenewalError> {
    #[error("auth: {0}")]
    Auth(#[source] token_manager::Error<RenewalError>),
    #[error("access token is not a valid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
}

pub struct Interceptor<Provider, AuthRevoker>
where
    Provider: TokenProvider,
{
    pub tokens: TokenManager<Provider>,
    pub revoker: AuthRevoker,
    pub account: String,
}

impl<Provider, AuthRevoker> Interceptor<Provider, AuthRevoker>
where
    Provider: TokenProvider + 'static,
    Provider::Token: ExpiringToken,
    Provider::Error: std::error::Error + TransientError + 'static,
    AuthRevoker: Revoker,
{
    pub fn new(tokens: TokenManager<Provider>, revoker: AuthRevoker) -> Self {
        Self {
            tokens,
            revoker,
            account: DEFAULT_ACCOUNT.to_owned(),
        }
    }

    /// Sets the `Authorization` header of `request` to a valid bearer token.
    pub async fn intercept(
        &self,
        request: &mut reqwest::Request,
        cancel: &CancellationToken,
    ) -> Result<(), Error<Provider::Error>> {
        let record = self.tokens.get_token(cancel).await.map_err(Error::Auth)?;

        let mut value = HeaderValue::from_str(&format!("Bearer {}", record.access_token))?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);

        Ok(())
    }

    /// Forces a refresh after the server rejected our token. Returns whether
    /// retrying the request is worthwhile.
    pub async fn handle_unauthorized(
        &self,
        response: &reqwest::Response,
        cancel: &CancellationToken,
    ) -> bool {
        if response.status() != StatusCode::UNAUTHORIZED {
            debug!(message = "Not an unauthorized response", status = %response.status());
            return false;
        }

        info!(message = "Request unauthorized, forcing token refresh", url = %response.url());
        match self.tokens.refresh(cancel).await {
            Ok(_) => true,
            Err(err) => {
                warn!(message = "Forced token refresh failed", error = %err);
                false
            }
        }
    }

    /// Revokes the cached token. Returns `false` when nothing is cached.
    ///
    /// The revoked token stays cached, so requests keep failing until the
    /// user authenticates again instead of silently picking up a new session.
    pub async fn revoke_token(
        &self,
        cancel: &CancellationToken,
    ) -> Result<bool, RevokeError<AuthRevoker::Error>> {
        let record = match self.tokens.cached().await {
            Some(record) => record,
            None => {
                debug!(message = "No token cached, nothing to revoke");
                return Ok(false);
            }
        };

        let account = record.account.as_deref().unwrap_or(&self.account);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RevokeError::Cancelled),
            res = self.revoker.revoke(&record.access_token, account) => {
                res.map_err(RevokeError::Revoker)?;
                Ok(true)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RevokeError<RevokerError> {
    #[error("revoke: {0}")]
    Revoker(#[source] RevokerError),
    #[error("cancelled while revoking")]
    Cancelled,
}
