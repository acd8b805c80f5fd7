//! Google Cloud REST access authenticated with the local gcloud session.

use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use self::{
    auth::{
        interceptor::{self, Interceptor},
        ExpiringToken, Revoker, TokenProvider, TransientError,
    },
    utils::check_status,
};

pub use self::utils::ServerError;

pub mod auth;
mod utils;

pub struct Client<AuthTokenProvider, AuthRevoker>
where
    AuthTokenProvider: TokenProvider,
{
    pub client: reqwest::Client,
    pub interceptor: Interceptor<AuthTokenProvider, AuthRevoker>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error<AuthError> {
    #[error("auth: {0}")]
    Auth(#[source] interceptor::Error<AuthError>),
    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("server: {0}")]
    Server(#[from] ServerError),
    #[error("request cancelled")]
    Cancelled,
}

impl<AuthTokenProvider, AuthRevoker> Client<AuthTokenProvider, AuthRevoker>
where
    AuthTokenProvider: TokenProvider + 'static,
    AuthTokenProvider::Token: ExpiringToken,
    AuthTokenProvider::Error: std::error::Error + TransientError + 'static,
    AuthRevoker: Revoker,
{
    pub fn build_request(
        &self,
        method: Method,
        url: &str,
    ) -> Result<reqwest::Request, Error<AuthTokenProvider::Error>> {
        self.client
            .request(method, url)
            .build()
            .map_err(Error::Reqwest)
    }

    async fn send(
        &self,
        mut request: reqwest::Request,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, Error<AuthTokenProvider::Error>> {
        self.interceptor
            .intercept(&mut request, cancel)
            .await
            .map_err(Error::Auth)?;

        debug!(message = "Sending request", method = %request.method(), url = %request.url());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = self.client.execute(request) => res.map_err(Error::Reqwest),
        }
    }

    /// Sends `request` with a bearer token. A 401 forces a token refresh and,
    /// if that worked, the request is sent once more.
    pub async fn execute(
        &self,
        request: reqwest::Request,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, Error<AuthTokenProvider::Error>> {
        // Streaming bodies cannot be replayed.
        let retry = request.try_clone();

        let mut res = self.send(request, cancel).await?;

        if res.status() == StatusCode::UNAUTHORIZED {
            if self.interceptor.handle_unauthorized(&res, cancel).await {
                if let Some(retry) = retry {
                    info!(message = "Retrying request with refreshed token", url = %retry.url());
                    res = self.send(retry, cancel).await?;
                }
            } else if cancel.is_cancelled() {
                // The refresh was abandoned, not refused.
                return Err(Error::Cancelled);
            }
        }

        check_status(&res)?;
        Ok(res)
    }

    pub async fn get_json<T>(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<T, Error<AuthTokenProvider::Error>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let req = self.build_request(Method::GET, url)?;
        let res = self.execute(req, cancel).await?;
        Self::parse_json(res).await
    }

    async fn parse_json<T>(res: reqwest::Response) -> Result<T, Error<AuthTokenProvider::Error>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        res.json().await.map_err(Error::Reqwest)
    }
}
