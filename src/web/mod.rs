//! Web layer module
//!
//! The HTTP surface of the proxy: the stream endpoint, a health endpoint,
//! and the server glue. Handlers stay thin and delegate to the multiplexer
//! and session manager.
//!
//! Streaming responses are never subject to a write deadline: axum/hyper do
//! not arm one, and nothing here adds one, so a stream can stay open for
//! hours. The `read_timeout`/`write_timeout` config values are advisory.

use anyhow::Result;
use axum::{
    routing::{any, get},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::{
    config::Config, metrics::StreamMetrics, sessions::SessionManager, streaming::Multiplexer,
};

pub mod handlers;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub multiplexer: Arc<Multiplexer>,
    pub sessions: Arc<SessionManager>,
    pub metrics: Arc<StreamMetrics>,
}

/// Web server configuration and setup
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(
        config: Config,
        multiplexer: Arc<Multiplexer>,
        sessions: Arc<SessionManager>,
    ) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port).parse()?;
        let metrics = multiplexer.metrics();
        let app = Self::create_router(AppState {
            config,
            multiplexer,
            sessions,
            metrics,
        });
        Ok(Self { app, addr })
    }

    /// Create the router with all routes and middleware.
    ///
    /// The stream route matches every method so HEAD can be answered without
    /// side effects and anything else gets a proper 405 (axum's `get`
    /// service would otherwise run the full GET handler for HEAD).
    pub fn create_router(state: AppState) -> Router {
        Router::new()
            .route("/stream", any(handlers::stream_channel))
            .route("/health", get(handlers::health_check))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Start the web server; returns once a shutdown signal is received.
    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;
        Ok(())
    }

    /// Get the host address
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("shutdown signal received");
}
