#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

mod bridge;
mod cli;
mod config;
mod db;
mod discord;
mod matrix;
mod media;
mod parsers;
mod source;
mod utils;
mod web;

use bridge::{BridgeCore, PortalSettings};
use cli::Cli;
use config::Config;
use web::WebServer;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_from_file(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    if cli.generate_registration {
        print!("{}", cli::registration_yaml(&config)?);
        return Ok(());
    }

    utils::logging::init_tracing(&config.logging)?;
    let config = Arc::new(config);
    info!("matrix-port starting up");

    let db_manager = Arc::new(db::DatabaseManager::new(&config.database).await?);
    db_manager.migrate().await?;

    let bot_user_id = config.bot_user_id();
    let matrix_client = Arc::new(matrix::MatrixClient::new(
        &config.bridge.homeserver_url,
        &config.registration.appservice_token,
        &bot_user_id,
    )?);

    let discord = Arc::new(discord::DiscordAdapter::new(&config.discord));
    let sources = Arc::new(source::SourceRegistry::new());
    sources.register(discord.clone());

    let bridge = Arc::new(BridgeCore::new(
        PortalSettings::from_config(&config),
        matrix_client,
        db_manager,
        sources,
        Arc::new(media::MediaHandler::new()),
    ));
    if let Err(err) = bridge.start().await {
        error!("bridge failed its startup checks: {}", err);
        return Err(err.into());
    }
    discord.set_bridge(bridge.clone()).await;

    let processor = Arc::new(matrix::MatrixEventProcessor::new(
        bridge.clone(),
        &bot_user_id,
        &config.bridge.homeserver_url,
    ));
    let web_server = WebServer::new(config.clone(), bridge, processor);

    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start().await {
            error!("web server error: {}", e);
        }
    });

    let gateway = discord.clone();
    let discord_handle = tokio::spawn(async move {
        if let Err(e) = gateway.start().await {
            error!("discord adapter error: {}", e);
        }
    });

    tokio::select! {
        _ = web_handle => {},
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        },
    }

    discord_handle.abort();
    if let Err(e) = discord.stop().await {
        error!("failed to stop discord adapter: {}", e);
    }
    info!("matrix-port shutting down");
    Ok(())
}
