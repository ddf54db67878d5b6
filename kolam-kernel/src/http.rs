/**
 * HTTP CONTROL SURFACE
 *
 * ROUTES:
 * - GET  /health                       = broker connection, uptime, pipeline counters
 * - POST /api/control/{device_id}      = publish a control command for a device
 * - GET  /api/device/{device_id}/status = last known device status (cache, then durable)
 */

use crate::coordinator::{CommandError, Pipeline};
use crate::health::{HealthTracker, KernelHealth};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub health: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/control/{device_id}", post(control_device))
        .route("/api/device/{device_id}/status", get(device_status))
        .with_state(app_state)
}

async fn get_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let mut health = app.health.get_health();
    health.active_alerts = app.pipeline.tracker().active_alerts().await.len();
    Json(health)
}

// POST /api/control/{device_id}
async fn control_device(
    State(app): State<AppState>,
    Path(device_id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    match app.pipeline.submit_command(&device_id, body).await {
        Ok(command) => (
            StatusCode::OK,
            Json(json!({ "success": true, "message": "Command sent", "command": command })),
        ),
        Err(e @ CommandError::InvalidBody) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
        Err(e) => {
            tracing::error!(%device_id, error = %e, "control command failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": e.to_string() })))
        }
    }
}

// GET /api/device/{device_id}/status
async fn device_status(State(app): State<AppState>, Path(device_id): Path<String>) -> (StatusCode, Json<Value>) {
    match app.pipeline.fanout().device_status(&device_id).await {
        Ok(Some(status)) => (StatusCode::OK, Json(status)),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "Device not found" }))),
        Err(e) => {
            tracing::error!(%device_id, error = %e, "device status lookup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() })))
        }
    }
}
