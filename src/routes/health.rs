use axum::{Json, Router, extract::State, routing::get};

use crate::{
    dto::health::{HealthResponse, SummaryResponse},
    error::AppError,
    services::health_service,
    state::SharedState,
};

#[utoipa::path(
    get,
    path = "/healthcheck",
    tag = "status",
    responses((status = 200, description = "Service is up; status tells whether the remote store is reachable", body = HealthResponse))
)]
/// Return the current health status of the backend.
pub async fn healthcheck(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(health_service::health_status(&state))
}

#[utoipa::path(
    get,
    path = "/summary",
    tag = "status",
    responses(
        (status = 200, description = "Session counters", body = SummaryResponse),
        (status = 503, description = "Session busy for too long")
    )
)]
/// Return read-only counters of the running session.
pub async fn summary(State(state): State<SharedState>) -> Result<Json<SummaryResponse>, AppError> {
    let summary = health_service::summary(&state).await?;
    Ok(Json(summary))
}

/// Configure the status routes subtree.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new()
        .route("/healthcheck", get(healthcheck))
        .route("/summary", get(summary))
}
