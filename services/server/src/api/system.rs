// Liveness/readiness endpoint.
use crate::api::error::{api_internal_message, ApiError};
use crate::api::types::HealthStatus;
use crate::app::AppState;
use axum::extract::State;
use axum::Json;

// Distinguishes the two persistence dependencies so an operator can tell
// which side is down. Write availability survives a watched-store outage
// (the outbox absorbs it), so this is observability, not gating.
pub async fn system_health(
    State(state): State<AppState>,
) -> Result<Json<HealthStatus>, ApiError> {
    let report = state.features.health().await;
    if !report.store_ok {
        return Err(api_internal_message("system-of-record unavailable"));
    }
    if !report.watched_ok {
        return Err(api_internal_message("watched store unavailable"));
    }
    Ok(Json(HealthStatus {
        status: "ok".to_string(),
    }))
}
