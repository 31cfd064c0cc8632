//! Health, liveness and readiness endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::AppState;
use crate::network::HealthState;

/// Always 200; `state` carries the lifecycle phase.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let app = &state.app;
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "in_flight": state.shutdown.in_flight_count(),
        "collections": app.collections.count(),
        "connections": app.registry.count(),
        "lanes": app.dispatcher.lane_count(),
    }))
}

pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// 200 only while `Ready`, so load balancers stop routing once draining.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    match state.shutdown.health_state() {
        HealthState::Ready => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}
