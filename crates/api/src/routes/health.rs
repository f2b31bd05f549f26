//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;
use crate::websocket::PROTOCOL_VERSION;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub protocol_version: String,
    pub store: String,
    pub store_status: String,
    pub outbound: String,
    pub active_connections: usize,
    pub active_rooms: usize,
    pub uptime_secs: u64,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store_status = match state.sessions.ping().await {
        Ok(()) => "healthy".to_string(),
        Err(_) => "unhealthy".to_string(),
    };

    let overall_status = if store_status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let stats = state.hub.get_stats().await;

    (
        overall_status,
        Json(HealthResponse {
            status: if overall_status == StatusCode::OK {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            store: state.sessions.backend().to_string(),
            store_status,
            outbound: state.outbound.name().to_string(),
            active_connections: stats.active_connections,
            active_rooms: stats.active_rooms,
            uptime_secs: state.started_at.elapsed().as_secs(),
        }),
    )
}

/// Liveness probe (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe (checks if the store is reachable)
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.sessions.ping().await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
