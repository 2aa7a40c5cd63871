mod app;
mod config;
mod monitor;
mod platform;
mod poller;
mod relay;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::platform::telegram::{TelegramDelivery, TelegramSource};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,channel_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting channel relay");

    // A config file wins when given or present; otherwise use the environment.
    let config_path = std::env::args().nth(1).map(PathBuf::from).or_else(|| {
        let default = PathBuf::from("config.toml");
        default.exists().then_some(default)
    });

    let config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Config::load(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?
        }
        None => {
            info!("Loading configuration from environment");
            Config::from_env().context("Failed to load config from environment")?
        }
    };

    info!("Configuration loaded successfully");
    info!("  Channel: {}", config.source.channel_id);
    info!("  Whitelist: {:?}", config.delivery.whitelist_ids);
    info!("  Poll interval: {} ms", config.poller.poll_interval_ms);
    info!("  Poll window: {} messages", config.poller.poll_limit);

    let source = TelegramSource::connect(&config.source.credentials, config.source.channel_id)
        .await
        .context("Failed to connect to the message source")?;
    let delivery = TelegramDelivery::new(&config.delivery.token);

    app::run(
        &config,
        Arc::new(source),
        Arc::new(delivery),
        app::shutdown_signal(),
    )
    .await?;

    Ok(())
}
