/// Admin operations over the WebSocket channel.
pub mod admin_service;
/// OpenAPI documentation generation.
pub mod documentation;
/// Session bootstrap, player messages and shutdown.
pub mod game_service;
/// Health and summary service.
pub mod health_service;
/// Periodic saves, audits and cleanup.
pub mod maintenance;
/// Ordered persistence writer with differential debouncing.
pub mod persistence_worker;
/// Remote store connection supervisor.
pub mod storage_supervisor;
/// WebSocket connection and message handling service.
pub mod websocket_service;
