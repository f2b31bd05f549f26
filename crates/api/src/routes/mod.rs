//! API routes

pub mod health;
pub mod sessions;
pub mod tickets;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{state::AppState, websocket::ws_handler};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let api_v1_routes = Router::new()
        .route("/webhooks/whatsapp", post(webhooks::receive_whatsapp))
        .route("/sessions/find-or-create", post(sessions::find_or_create))
        .route("/tickets/:ticket_id/status", patch(tickets::update_status))
        .route("/tickets/:ticket_id/messages", get(tickets::list_messages));

    // Agents are identified by query parameters
    let websocket_routes = Router::new().route("/ws", get(ws_handler));

    Router::new()
        .merge(health_routes)
        .merge(websocket_routes)
        .nest("/api/v1", api_v1_routes)
        // Provider payloads are small; media is never inlined
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
