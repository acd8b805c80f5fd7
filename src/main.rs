use anyhow::Context;
use clap::Parser;
use gcloud_session::{
    config::{CliArgs, Command, Config},
    gcloud::{
        self,
        auth::{
            interceptor::Interceptor,
            revocation::OAuth2Revoker,
            token_manager::TokenManager,
        },
    },
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config = Config::from(&args);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let reqwest_client = reqwest::Client::builder()
        .build()
        .context("Failed to create HTTP client")?;

    let mut helper = config.config_helper();
    if args.command == Command::Revoke {
        // Revoke whatever gcloud already holds rather than minting a token for it.
        helper.force_auth_refresh = false;
    }

    let tokens = TokenManager::with_options(
        helper,
        config.expiry_margin,
        config.stale_policy,
    );
    let revoker = OAuth2Revoker {
        client: reqwest_client.clone(),
        endpoint: config.revoke_endpoint.clone(),
    };
    let client = gcloud::Client {
        client: reqwest_client,
        interceptor: Interceptor::new(tokens, revoker),
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling");
                cancel.cancel();
            }
        }
    });

    match args.command {
        Command::Token => {
            let record = client.interceptor.tokens.get_token(&cancel).await?;
            println!("{}", record.access_token);
        }
        Command::Get { url } => {
            let body = match client.get_json::<serde_json::Value>(&url, &cancel).await {
                Err(gcloud::Error::Server(err)) if err.is_unauthorized() => {
                    return Err(anyhow::Error::new(err)
                        .context("Credentials rejected, run `gcloud auth login`"));
                }
                res => res?,
            };
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Command::Revoke => {
            // A new process starts with an empty cache.
            client.interceptor.tokens.get_token(&cancel).await?;
            let revoked = client.interceptor.revoke_token(&cancel).await?;
            println!("{}", if revoked { "revoked" } else { "nothing to revoke" });
        }
    }

    Ok(())
}
