use std::time::Duration;

use tokio::time::timeout;
use tracing::warn;

use crate::{
    dto::health::{HealthResponse, SummaryResponse},
    error::ServiceError,
    state::SharedState,
};

/// Longest wait for the session before a status read gives up.
pub const STATUS_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Report whether the remote store is reachable.
pub fn health_status(state: &SharedState) -> HealthResponse {
    if state.is_degraded() {
        warn!("remote store unavailable (degraded mode)");
        HealthResponse::degraded()
    } else {
        HealthResponse::ok()
    }
}

/// Read-only session counters.
pub async fn summary(state: &SharedState) -> Result<SummaryResponse, ServiceError> {
    timeout(STATUS_READ_TIMEOUT, state.summary())
        .await
        .map_err(|_| ServiceError::Timeout)
}
