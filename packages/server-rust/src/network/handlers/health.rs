//! Health, liveness, and readiness endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::AppState;
use crate::network::HealthState;

/// Detailed health JSON, including every resource group's pool.
///
/// Always 200; the `state` field says whether the server is actually ready.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let groups: Vec<Value> = state
        .resources
        .groups()
        .iter()
        .map(|group| {
            let pool = group.pool();
            json!({
                "name": group.name(),
                "state": pool.state().as_str(),
                "size": pool.size(),
                "active": pool.active(),
                "queued": pool.queued(),
            })
        })
        .collect();

    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "connections": state.connections.count(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "groups": groups,
    }))
}

/// Liveness probe: 200 while the process responds.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 when `Ready`, 503 while starting or draining.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
