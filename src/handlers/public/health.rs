use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::database::HealthStatus;
use crate::server::AppState;

/// GET /health - 200 while the database answers, 503 otherwise.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.health.check().await {
        HealthStatus::Healthy => (
            StatusCode::OK,
            Json(json!({ "status": "OK", "message": "Database connection healthy." })),
        ),
        HealthStatus::Unhealthy { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "Error", "message": "Database connection unhealthy." })),
        ),
    }
}
