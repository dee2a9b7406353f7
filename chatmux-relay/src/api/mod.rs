//! HTTP and WebSocket surface
//!
//! - `GET /ws/chat?source=<platform>` live chat stream (history first)
//! - `GET /healthz` liveness probe
//! - `GET /configz` effective configuration, secrets redacted

pub mod handlers;
pub mod ws;

use crate::relay::ChatRelay;
use axum::{routing::get, Router};
use chatmux_common::config::RelayConfig;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application context passed to all handlers
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<ChatRelay>,
    pub config: Arc<RelayConfig>,
    /// Cancelled at shutdown; open sockets close when it fires
    pub shutdown: CancellationToken,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(relay: Arc<ChatRelay>, config: Arc<RelayConfig>, shutdown: CancellationToken) -> Self {
        Self {
            relay,
            config,
            shutdown,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/chat", get(ws::chat_socket))
        .route("/healthz", get(handlers::healthz))
        .route("/configz", get(handlers::configz))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        // Origin policy for the socket lives in the ws handler
        .layer(CorsLayer::permissive())
}
