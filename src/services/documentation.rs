use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the tile reveal backend.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::health::summary,
        crate::routes::websocket::ws_handler,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::health::SummaryResponse,
        )
    ),
    tags(
        (name = "status", description = "Health and session counters"),
        (name = "game", description = "WebSocket channel for players and admins"),
    )
)]
pub struct ApiDoc;
