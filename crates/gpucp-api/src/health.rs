//! Liveness/readiness probes. Liveness never depends on anything;
//! readiness reflects whether this process finished wiring its own
//! copy of the service registry.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::ApiState;

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "gpucp-api",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn readiness_check(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    if state.is_ready() {
        (StatusCode::OK, Json(json!({ "ready": true })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false })),
        )
    }
}

pub async fn liveness_check() -> Json<Value> {
    Json(json!({ "alive": true }))
}

pub async fn metrics_handler() -> (StatusCode, String) {
    match crate::metrics::render() {
        Ok(body) => (StatusCode::OK, body),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to render metrics".to_string(),
        ),
    }
}
