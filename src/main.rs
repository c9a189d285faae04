/// Freelance marketplace Telegram bot - Main entry point.
///
/// The bot delivers phone verification codes to users who link their Telegram
/// account, answers a small set of commands and sends login notifications.
/// Updates arrive through a webhook in production and long polling in
/// development. The web application talks to the bot over a small HTTP API.
mod bot;
mod code;
mod commands;
mod config;
mod error;
mod messenger;
mod server;
mod store;
mod tasks;

#[cfg(test)]
mod testing;

use bot::{BotSession, DeliveryMode, Gateway};
use config::Config;
use error::Result;
use server::AppState;
use std::sync::Arc;
use store::Store;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "freelance_tg_bot=info,teloxide=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting freelance marketplace bot...");

    // Load .env file if present (for development)
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or error loading it: {}", e);
    }

    let config = Arc::new(Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?);

    info!("Configuration loaded ({:?})", config.environment);
    info!("Verification codes live for {:?}", config.code_ttl);

    let store = Arc::new(Store::open(&config.database_path)?);
    info!("Database opened at {}", config.database_path);

    // A missing token or an unreachable API leaves the HTTP surface up with the bot disabled.
    let gateway = match BotSession::initialize(config.clone(), store.clone()).await {
        Ok((session, bot)) => {
            let session = Arc::new(session);
            if session.mode() == DeliveryMode::Polling {
                bot::spawn_polling(session.clone(), bot);
            }
            Gateway::Ready(session)
        }
        Err(e) => {
            error!("Bot initialization failed, continuing without Telegram: {}", e);
            Gateway::Disabled {
                reason: e.to_string(),
            }
        }
    };

    let sweeper = tasks::spawn_expiry_sweep(store.clone(), config.expiry_sweep_interval);

    let state = AppState {
        gateway: gateway.clone(),
        store,
        config,
    };
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };
    let served = server::serve(state, shutdown).await;

    sweeper.abort();
    if let Some(session) = gateway.session() {
        session.stop().await;
    }

    info!("Bot stopped");

    served
}
