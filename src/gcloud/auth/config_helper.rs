//! Obtain access tokens from the local `gcloud` installation.

use std::{process::Stdio, time::Duration};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::{process::Command, time::Instant};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("gcloud exited with {status}: {stderr}")]
    Exit {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("malformed config-helper output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no active credential, run `gcloud auth login`")]
    MissingToken,
    #[error("config-helper output has no token expiry")]
    MissingExpiry,
}

// Fragments gcloud prints when the token endpoint cannot be reached.
const NETWORK_FAILURES: &[&str] = &[
    "unable to find the server",
    "failed to establish a new connection",
    "max retries exceeded",
    "connection refused",
    "connection reset",
    "timed out",
    "temporary failure in name resolution",
    "network is unreachable",
];

impl super::TransientError for Error {
    fn is_transient(&self) -> bool {
        match self {
            Error::Exit { stderr, .. } => {
                let stderr = stderr.to_lowercase();
                NETWORK_FAILURES
                    .iter()
                    .any(|fragment| stderr.contains(fragment))
            }
            _ => false,
        }
    }
}

/// Runs `gcloud config config-helper`, which prints the active account and
/// a valid access token as JSON.
pub struct ConfigHelper {
    /// Path or name of the `gcloud` executable.
    pub program: String,
    /// Ask gcloud for a brand new token instead of its own cached one.
    pub force_auth_refresh: bool,
}

impl Default for ConfigHelper {
    fn default() -> Self {
        Self {
            program: "gcloud".to_owned(),
            force_auth_refresh: true,
        }
    }
}

impl ConfigHelper {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(["config", "config-helper", "--format=json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if self.force_auth_refresh {
            command.arg("--force-auth-refresh");
        }
        command
    }

    async fn run(&self) -> Result<HelperOutput, Error> {
        debug!(
            message = "Running credential helper",
            program = %self.program,
            force_auth_refresh = self.force_auth_refresh,
        );

        let output = self
            .command()
            .output()
            .await
            .map_err(|source| Error::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(Error::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let parsed = serde_json::from_slice(&output.stdout)?;
        Ok(parsed)
    }

    /// Fetch a token from gcloud.
    pub async fn perform(&self) -> Result<Token, Error> {
        let output = self.run().await?;
        Token::from_output(output, Utc::now(), Instant::now())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HelperOutput {
    #[serde(default)]
    configuration: Configuration,
    #[serde(default)]
    credential: Credential,
}

#[derive(Debug, Default, Deserialize)]
struct Configuration {
    #[serde(default)]
    properties: Properties,
}

#[derive(Debug, Default, Deserialize)]
struct Properties {
    #[serde(default)]
    core: CoreProperties,
}

#[derive(Debug, Default, Deserialize)]
struct CoreProperties {
    account: Option<String>,
}

#[derive(Default, Deserialize)]
struct Credential {
    access_token: Option<String>,
    token_expiry: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &self.access_token.as_ref().map(|_| "[censored]"))
            .field("token_expiry", &self.token_expiry)
            .finish()
    }
}

#[derive(Clone)]
pub struct Token {
    pub access_token: String,
    pub expires_at: Instant,
    pub account: Option<String>,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[censored]")
            .field("expires_at", &self.expires_at)
            .field("account", &self.account)
            .finish()
    }
}

impl Token {
    /// Converts the wall-clock expiry reported by gcloud into a monotonic
    /// instant, relative to the given pair of "now" readings.
    fn from_output(
        output: HelperOutput,
        now_utc: DateTime<Utc>,
        now: Instant,
    ) -> Result<Self, Error> {
        let HelperOutput {
            configuration,
            credential,
        } = output;

        let access_token = credential
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or(Error::MissingToken)?;
        let token_expiry = credential.token_expiry.ok_or(Error::MissingExpiry)?;

        // An expiry in the past fails `to_std`; such a token is already dead.
        let remaining = (token_expiry - now_utc).to_std().unwrap_or(Duration::ZERO);

        Ok(Self {
            access_token,
            expires_at: now + remaining,
            account: configuration.properties.core.account,
        })
    }
}

#[async_trait::async_trait]
impl super::TokenProvider for ConfigHelper {
    type Token = Token;
    type Error = Error;

    async fn get_auth_token(&self) -> Result<Self::Token, Self::Error> {
        self.perform().await
    }
}

impl super::Token for Token {
    fn access_token(&self) -> &str {
        self.access_token.as_str()
    }

    fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }
}

impl super::ExpiringToken for Token {
    fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcloud::auth::TransientError;

    const SAMPLE: &str = r#"{
        "configuration": {
            "active_configuration": "default",
            "properties": {
                "core": {
                    "account": "someone@example.com",
                    "project": "my-project"
                }
            }
        },
        "credential": {
            "access_token": "ya29.sample",
            "id_token": "eyJhbGciOi.sample",
            "token_expiry": "2026-10-19T13:00:00Z"
        },
        "sentinels": {
            "config_sentinel": "/home/someone/.config/gcloud/config_sentinel"
        }
    }"#;

    fn now_utc() -> DateTime<Utc> {
        "2026-10-19T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn token_from_sample_output() {
        let output: HelperOutput = serde_json::from_str(SAMPLE).unwrap();
        let now = Instant::now();
        let token = Token::from_output(output, now_utc(), now).unwrap();

        assert_eq!(token.access_token, "ya29.sample");
        assert_eq!(token.expires_at, now + Duration::from_secs(3600));
        assert_eq!(token.account.as_deref(), Some("someone@example.com"));
        assert_eq!(
            crate::gcloud::auth::Token::account(&token),
            Some("someone@example.com")
        );
    }

    #[test]
    fn expiry_in_the_past_is_now() {
        let output: HelperOutput = serde_json::from_str(SAMPLE).unwrap();
        let now = Instant::now();
        let later: DateTime<Utc> = "2026-10-19T14:00:00Z".parse().unwrap();
        let token = Token::from_output(output, later, now).unwrap();

        assert_eq!(token.expires_at, now);
    }

    #[test]
    fn missing_access_token() {
        let output: HelperOutput = serde_json::from_str(
            r#"{"configuration": {"properties": {"core": {}}}, "credential": {}}"#,
        )
        .unwrap();
        let err = Token::from_output(output, now_utc(), Instant::now()).unwrap_err();
        assert!(matches!(err, Error::MissingToken), "{err:?}");

        let output: HelperOutput = serde_json::from_str(
            r#"{"credential": {"access_token": "", "token_expiry": "2026-10-19T13:00:00Z"}}"#,
        )
        .unwrap();
        let err = Token::from_output(output, now_utc(), Instant::now()).unwrap_err();
        assert!(matches!(err, Error::MissingToken), "{err:?}");
    }

    #[test]
    fn missing_expiry() {
        let output: HelperOutput =
            serde_json::from_str(r#"{"credential": {"access_token": "ya29.sample"}}"#).unwrap();
        let err = Token::from_output(output, now_utc(), Instant::now()).unwrap_err();
        assert!(matches!(err, Error::MissingExpiry), "{err:?}");
    }

    #[test]
    fn debug_hides_token() {
        let output: HelperOutput = serde_json::from_str(SAMPLE).unwrap();
        let fmt = format!("{output:?}");
        assert!(!fmt.contains("ya29.sample"), "{fmt}");

        let token = Token::from_output(output, now_utc(), Instant::now()).unwrap();
        let fmt = format!("{token:?}");
        assert!(!fmt.contains("ya29.sample"), "{fmt}");
        assert!(fmt.contains("someone@example.com"), "{fmt}");
    }

    #[cfg(unix)]
    fn exit_error(stderr: &str) -> Error {
        use std::os::unix::process::ExitStatusExt;
        Error::Exit {
            status: std::process::ExitStatus::from_raw(1 << 8),
            stderr: stderr.to_owned(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn network_failures_are_transient() {
        let err = exit_error(
            "ERROR: There was a problem refreshing your current auth tokens: \
             Unable to find the server at oauth2.googleapis.com",
        );
        assert!(err.is_transient());

        let err = exit_error(
            "ERROR: You do not currently have an active account selected.\n\
             Please run:\n\n  $ gcloud auth login",
        );
        assert!(!err.is_transient());

        assert!(!Error::MissingToken.is_transient());
    }

    #[tokio::test]
    async fn missing_program() {
        let helper = ConfigHelper {
            program: "gcloud-session-test-no-such-program".to_owned(),
            force_auth_refresh: true,
        };
        let err = helper.perform().await.unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }), "{err:?}");
        assert!(!err.is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_program() {
        let helper = ConfigHelper {
            program: "false".to_owned(),
            force_auth_refresh: false,
        };
        let err = helper.perform().await.unwrap_err();
        assert!(matches!(err, Error::Exit { .. }), "{err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn garbage_output() {
        // `echo` prints its arguments, which is not JSON.
        let helper = ConfigHelper {
            program: "echo".to_owned(),
            force_auth_refresh: true,
        };
        let err = helper.perform().await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "{err:?}");
    }
}
