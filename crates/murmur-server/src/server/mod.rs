use crate::auth::JwtValidator;
use crate::db::Database;
use crate::messages::MessageRepository;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use murmur_relay::{HubHandle, MessageRouter, RelayConfig};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

mod routes;

/// Server application state
pub struct AppState {
    pub db: Database,
    pub repository: Arc<MessageRepository>,
    pub router: Arc<MessageRouter<MessageRepository>>,
    pub hub: HubHandle,
    pub validator: Arc<JwtValidator>,
    pub relay: RelayConfig,
}

impl AppState {
    pub fn new(db: Database, hub: HubHandle, validator: JwtValidator, relay: RelayConfig) -> Self {
        let repository = Arc::new(MessageRepository::new(db.clone()));
        let router = Arc::new(MessageRouter::new(repository.clone(), hub.clone()));
        Self {
            db,
            repository,
            router,
            hub,
            validator: Arc::new(validator),
            relay,
        }
    }
}

/// Serve HTTP and WebSocket traffic until `shutdown` is cancelled
pub async fn start(state: Arc<AppState>, bind: &str, shutdown: CancellationToken) -> Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!("Starting Axum HTTP server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped");
    Ok(())
}

/// Create the Axum router with all routes and middleware
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state.clone())
        .merge(routes::websocket::router(state.clone()))
        .merge(routes::conversations::router(state))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}

/// Health check endpoint (for load balancers)
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connections = state.hub.connection_count().await;
    let database = state.db.health_check().await;

    match (connections, database) {
        (Ok(connections), Ok(true)) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": "murmur-server",
                "version": env!("CARGO_PKG_VERSION"),
                "connections": connections
            })),
        ),
        (connections, database) => {
            if let Err(e) = &connections {
                warn!("Health check: relay hub unavailable: {}", e);
            }
            match &database {
                Ok(true) => {}
                Ok(false) => warn!("Health check: database unhealthy"),
                Err(e) => warn!("Health check: database error: {}", e),
            }
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "murmur-server",
                    "version": env!("CARGO_PKG_VERSION"),
                    "hub": connections.is_ok(),
                    "database": matches!(database, Ok(true))
                })),
            )
        }
    }
}
