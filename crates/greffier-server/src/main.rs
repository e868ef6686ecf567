mod api;
mod auth;
mod config;
mod error;
mod stream;
mod verify;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use greffier_pipeline::bot::BotClient;
use greffier_pipeline::summarizer::Summarizer;
use greffier_pipeline::transcriber::Transcriber;
use greffier_pipeline::Orchestrator;
use greffier_store::Database;
use greffier_vault::Vault;

use crate::api::AppState;
use crate::auth::Authenticator;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,greffier_server=debug")),
        )
        .init();

    info!(
        "Starting greffier meeting-artifact server v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Absence of the master key is fatal; nothing can be wrapped or
    // unwrapped without it.
    let config = ServerConfig::from_env().context("configuration error")?;
    info!(
        port = config.port,
        vault_dir = %config.vault_dir.display(),
        bot_provider = %config.bot_base_url,
        auth_provider = config.auth_userinfo_url.is_some(),
        transcriber = config.transcriber_cmd.is_some(),
        summarizer = config.summarizer_url.is_some(),
        "Loaded configuration"
    );
    if config.transcriber_cmd.is_none() || config.summarizer_url.is_none() {
        tracing::warn!(
            "one or more engines unconfigured; their development MOCKS will serve output"
        );
    }

    let db = match &config.db_path {
        Some(path) => Database::open_at(path, &config.master_key)?,
        None => Database::new(&config.master_key)?,
    };
    let db = Arc::new(Mutex::new(db));

    let vault = Arc::new(Vault::open(config.vault_dir.clone()).await?);

    let bot = Arc::new(BotClient::new(
        config.bot_base_url.clone(),
        config.bot_api_key.clone(),
    ));
    let transcriber = Arc::new(Transcriber::new(config.transcriber_cmd.clone()));
    let summarizer = Arc::new(Summarizer::new(
        config.summarizer_url.clone(),
        config.summarizer_model.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        Arc::clone(&vault),
        bot,
        transcriber,
        summarizer,
    ));

    let auth = Arc::new(Authenticator::new(
        config.auth_userinfo_url.clone(),
        config.auth_static_tokens.clone(),
    ));

    // Identity cache cleanup every 10 min.
    let auth_for_purge = Arc::clone(&auth);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            interval.tick().await;
            auth_for_purge.purge_expired().await;
        }
    });

    let state = AppState {
        db,
        vault,
        orchestrator,
        auth,
        bot_default_name: config.bot_default_name.clone(),
    };

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));

    tokio::select! {
        result = api::serve(state, addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
