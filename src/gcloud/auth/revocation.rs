//! Revoke tokens with Google's OAuth2 endpoint.

use tracing::info;

use crate::gcloud::utils::{check_status, ServerError};

pub const GOOGLE_REVOKE_ENDPOINT: &str = "https://oauth2.googleapis.com/revoke";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("server: {0}")]
    Server(#[from] ServerError),
    #[error("form encoding: {0}")]
    Encode(#[from] serde_urlencoded::ser::Error),
}

pub struct OAuth2Revoker {
    pub client: reqwest::Client,
    pub endpoint: String,
}

impl OAuth2Revoker {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: GOOGLE_REVOKE_ENDPOINT.to_owned(),
        }
    }
}

#[async_trait::async_trait]
impl super::Revoker for OAuth2Revoker {
    type Error = Error;

    async fn revoke(&self, access_token: &str, account: &str) -> Result<(), Self::Error> {
        let params = serde_urlencoded::to_string([("token", access_token)])?;

        let req = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(params)
            .build()?;

        let res = self.client.execute(req).await?;
        check_status(&res)?;

        info!(message = "Token revoked", account);
        Ok(())
    }
}
