use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use acestream_proxy::{
    config::Config, metrics::StreamMetrics, sessions::SessionManager, streaming::Multiplexer,
    web::WebServer,
};

#[derive(Parser)]
#[command(name = "acestream-proxy")]
#[command(version = "0.1.0")]
#[command(about = "A multiplexing IPTV reverse proxy for Ace Stream engines")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Engine base URL (overrides config file)
    #[arg(short = 'e', long, value_name = "URL")]
    engine_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with specified level
    let log_filter = format!("acestream_proxy={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting Ace Stream Proxy v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration from specified file
    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;
    info!("Configuration loaded from: {}", cli.config);

    // Override config with CLI arguments
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(engine_url) = cli.engine_url {
        config.engine.base_url = engine_url;
    }
    config.validate()?;

    info!("Using engine at: {}", config.engine.base_url);

    // One upstream HTTP client for the whole process: connect timeout only,
    // no total request timeout, live streams must remain open.
    let http_client = reqwest::Client::builder()
        .connect_timeout(config.web.connect_timeout)
        .pool_max_idle_per_host(8)
        .build()?;

    let metrics = Arc::new(StreamMetrics::new());
    let multiplexer = Arc::new(Multiplexer::new(
        http_client,
        config.streaming.clone(),
        Arc::clone(&metrics),
    ));
    let sessions = Arc::new(SessionManager::new());

    let web_server = WebServer::new(config, Arc::clone(&multiplexer), sessions)?;
    info!(
        "Starting web server on {}:{}",
        web_server.host(),
        web_server.port()
    );
    web_server.serve().await?;

    // Graceful shutdown: stop every stream and close their clients.
    multiplexer.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}
