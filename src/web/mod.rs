//! HTTP surface of the relay server.
//!
//! Thin handlers delegate to the streaming engine and the repositories;
//! admission and connection limiting happen at this boundary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::database::Database;
use crate::streaming::{ExpiredNotifier, MediaToolInfo, SessionRegistry};

pub mod auth;
pub mod handlers;
pub mod limiter;

pub use limiter::ConnectionLimiter;

#[derive(Clone)]
pub struct AppState {
    pub database: Database,
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub expired: Arc<ExpiredNotifier>,
    pub limiter: Arc<ConnectionLimiter>,
    pub media_tool: MediaToolInfo,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::status::health))
        // Named relay streams
        .route("/stream/:path", get(handlers::streams::stream_relay))
        .route("/stream/:path/hls", get(handlers::streams::stream_relay_hls))
        // Direct channel proxies
        .route("/api/proxy/channel/:id", get(handlers::streams::proxy_channel))
        .route(
            "/api/proxy/channel/:id/hls",
            get(handlers::streams::proxy_channel_hls),
        )
        // Session status
        .route("/api/streams/status", get(handlers::status::list_streams))
        .route("/api/streams/:id/status", get(handlers::status::stream_status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Web server bound to the configured address.
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", state.config.web.host, state.config.web.port).parse()?;
        Ok(Self {
            app: router(state),
            addr,
        })
    }

    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!("listening on {}", self.addr);
        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;
        Ok(())
    }
}
