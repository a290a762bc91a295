use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use relay_core::SocketService;
use serde::Serialize;
use serde_json::json;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use crate::config::ServerConfig;
use crate::session::SessionDirectory;

pub mod routes;
pub mod transport;

pub use transport::WsTransport;

/// Server application state
pub struct AppState {
    pub service: Arc<SocketService>,
    pub transport: Arc<WsTransport>,
    pub sessions: Arc<dyn SessionDirectory>,
    pub config: ServerConfig,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        service: Arc<SocketService>,
        transport: Arc<WsTransport>,
        sessions: Arc<dyn SessionDirectory>,
        config: ServerConfig,
    ) -> Self {
        Self {
            service,
            transport,
            sessions,
            config,
            started_at: Utc::now(),
        }
    }
}

/// Serve HTTP and WebSocket traffic until Ctrl+C.
pub async fn start(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.bind_addr;
    let app = create_router(state);

    info!("Starting Axum HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: Arc<AppState>) -> Router {
    let websocket_router = routes::websocket::router(state.clone());

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/presence", get(presence_handler))
        .with_state(state)
        .merge(websocket_router)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "relay-server",
            "version": env!("CARGO_PKG_VERSION"),
            "instance": state.service.config().instance_id.to_string(),
            "uptimeSeconds": (Utc::now() - state.started_at).num_seconds(),
        })),
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceResponse {
    deployment: String,
    instance: String,
    connections: usize,
    users: usize,
    local: Option<u64>,
    global: Option<u64>,
}

/// Connection counts as last published by the presence aggregator.
async fn presence_handler(State(state): State<Arc<AppState>>) -> Json<PresenceResponse> {
    let service = &state.service;
    let counts = service.presence().last_counts();
    Json(PresenceResponse {
        deployment: service.config().deployment.clone(),
        instance: service.config().instance_id.to_string(),
        connections: service.registry().count(),
        users: service.registry().user_count(),
        local: counts.map(|c| c.local),
        global: counts.map(|c| c.global),
    })
}
