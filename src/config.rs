use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::gcloud::auth::{
    config_helper::ConfigHelper, revocation::GOOGLE_REVOKE_ENDPOINT,
    token_manager::StalePolicy,
};

/// Talk to Google Cloud APIs with the credentials of the local gcloud session.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the gcloud executable
    #[arg(long, env = "GCLOUD_PATH", default_value = "gcloud")]
    pub gcloud: String,

    /// Refresh tokens this many seconds before they expire
    #[arg(long, env = "GCLOUD_SESSION_EXPIRY_MARGIN_SECS", default_value = "60")]
    pub expiry_margin_secs: u64,

    /// Ask gcloud for a new token on every refresh instead of its cached one
    #[arg(
        long,
        env = "GCLOUD_SESSION_FORCE_REFRESH",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    pub force_refresh: bool,

    /// What to do with a cached token when refreshing it fails
    #[arg(long, env = "GCLOUD_SESSION_STALE_POLICY", value_enum, default_value = "reject")]
    pub stale_policy: StalePolicyArg,

    /// OAuth2 token revocation endpoint
    #[arg(long, env = "GCLOUD_SESSION_REVOKE_ENDPOINT", default_value = GOOGLE_REVOKE_ENDPOINT)]
    pub revoke_endpoint: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print a valid access token
    Token,
    /// GET a Google Cloud REST URL and print the JSON response
    Get { url: String },
    /// Revoke the current access token
    Revoke,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalePolicyArg {
    Reject,
    AllowOnTransient,
}

impl From<StalePolicyArg> for StalePolicy {
    fn from(arg: StalePolicyArg) -> Self {
        match arg {
            StalePolicyArg::Reject => StalePolicy::Reject,
            StalePolicyArg::AllowOnTransient => StalePolicy::AllowOnTransient,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub gcloud: String,
    pub expiry_margin: Duration,
    pub force_refresh: bool,
    pub stale_policy: StalePolicy,
    pub revoke_endpoint: String,
    pub log_level: String,
}

impl From<&CliArgs> for Config {
    fn from(args: &CliArgs) -> Self {
        Self {
            gcloud: args.gcloud.clone(),
            expiry_margin: Duration::from_secs(args.expiry_margin_secs),
            force_refresh: args.force_refresh,
            stale_policy: args.stale_policy.into(),
            revoke_endpoint: args.revoke_endpoint.clone(),
            log_level: args.log_level.clone(),
        }
    }
}

impl Config {
    pub fn config_helper(&self) -> ConfigHelper {
        ConfigHelper {
            program: self.gcloud.clone(),
            force_auth_refresh: self.force_refresh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = CliArgs::try_parse_from(["gcloud-session", "token"]).unwrap();
        assert_eq!(args.command, Command::Token);

        let config = Config::from(&args);
        assert_eq!(config.expiry_margin, Duration::from_secs(60));
        assert_eq!(config.stale_policy, StalePolicy::Reject);
        assert_eq!(config.revoke_endpoint, GOOGLE_REVOKE_ENDPOINT);

        let helper = config.config_helper();
        assert!(helper.force_auth_refresh);
    }

    #[test]
    fn overrides() {
        let args = CliArgs::try_parse_from([
            "gcloud-session",
            "--gcloud",
            "/opt/google-cloud-sdk/bin/gcloud",
            "--expiry-margin-secs",
            "300",
            "--force-refresh",
            "false",
            "--stale-policy",
            "allow-on-transient",
            "get",
            "https://cloudresourcemanager.googleapis.com/v1/projects",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Command::Get {
                url: "https://cloudresourcemanager.googleapis.com/v1/projects".into()
            }
        );

        let config = Config::from(&args);
        assert_eq!(config.expiry_margin, Duration::from_secs(300));
        assert_eq!(config.stale_policy, StalePolicy::AllowOnTransient);

        let helper = config.config_helper();
        assert_eq!(helper.program, "/opt/google-cloud-sdk/bin/gcloud");
        assert!(!helper.force_auth_refresh);
    }
}
