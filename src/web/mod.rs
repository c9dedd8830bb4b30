use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use once_cell::sync::OnceCell;
use salvo::prelude::*;
use secrecy::SecretString;
use tracing::info;

use crate::bridge::BridgeCore;
use crate::config::Config;
use crate::matrix::MatrixEventProcessor;

pub mod handlers;
pub mod metrics;
pub mod middleware;

use self::middleware::auth::create_router;

pub struct WebState {
    pub bridge: Arc<BridgeCore>,
    pub processor: Arc<MatrixEventProcessor>,
    pub hs_token: SecretString,
    pub started_at: Instant,
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();

pub fn web_state() -> &'static WebState {
    WEB_STATE
        .get()
        .expect("web state is not initialized before handler execution")
}

#[derive(Clone)]
pub struct WebServer {
    config: Arc<Config>,
}

impl WebServer {
    pub fn new(
        config: Arc<Config>,
        bridge: Arc<BridgeCore>,
        processor: Arc<MatrixEventProcessor>,
    ) -> Self {
        let _ = WEB_STATE.set(WebState {
            bridge,
            processor,
            hs_token: SecretString::from(config.registration.homeserver_token.clone()),
            started_at: Instant::now(),
        });

        Self { config }
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.config.bridge.bind_address, self.config.bridge.port
        );
        info!("starting web server on {}", bind_addr);

        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor).serve(create_router()).await;

        Ok(())
    }
}
