use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iptv_relay::{
    config::Config,
    database::Database,
    streaming::{ffmpeg, ExpiredNotifier, SessionRegistry},
    web::{AppState, ConnectionLimiter, WebServer},
};

#[derive(Parser)]
#[command(name = "iptv-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "IPTV relay and fan-out server with shared upstream sessions")]
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

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(&cli.config)?;
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }
    let config = Arc::new(config);

    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    info!("database ready at {}", config.database.url);

    let media_tool = ffmpeg::probe_media_tool(&config.streaming.ffmpeg_command).await;
    info!(
        "media tool: available={}, version={:?}, command={}",
        media_tool.available, media_tool.version, media_tool.command
    );
    if !media_tool.available {
        warn!("media tool unavailable; streams will fail until it is installed");
    }

    let streaming_config = Arc::new(config.streaming.clone());
    let registry = SessionRegistry::new(streaming_config.clone());
    let expired = ExpiredNotifier::new(streaming_config);
    let limiter = Arc::new(ConnectionLimiter::new(
        config.streaming.enforce_connection_limits,
    ));

    let state = AppState {
        database,
        config: config.clone(),
        registry: registry.clone(),
        expired,
        limiter,
        media_tool,
    };

    let server = WebServer::new(state)?;
    server
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    registry.shutdown().await;
    info!("all sessions stopped, exiting");
    Ok(())
}
