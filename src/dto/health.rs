use serde::Serialize;
use utoipa::ToSchema;

/// Simple health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
}

impl HealthResponse {
    /// Create a health response indicating the remote store is reachable.
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }

    /// Create a health response indicating the server only writes local snapshots.
    pub fn degraded() -> Self {
        Self {
            status: "degraded".to_string(),
        }
    }
}

/// Read-only session counters returned by the `/summary` route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct SummaryResponse {
    /// Seated accounts.
    pub total_players: usize,
    /// Seated accounts with a live connection.
    pub connected_players: usize,
    /// Revealed tiles on the current board.
    pub revealed_tiles: usize,
    /// Current table cycle number.
    pub table_number: u32,
    /// Session status ("playing" or "resetting").
    pub status: String,
}
