//! Tile reveal backend entrypoint wiring persistence, the game session and the HTTP/WebSocket layers.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tile_reveal_back::{
    config::AppConfig,
    dao::{local_store::LocalSnapshotStore, persistence::PersistenceEngine, remote_store},
    routes,
    services::{game_service, maintenance, storage_supervisor},
    state::{AppState, SharedState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let engine = Arc::new(PersistenceEngine::new(LocalSnapshotStore::new(
        config.data_dir(),
    )));

    // One attempt before loading so a reachable remote snapshot wins over disk.
    let connector = remote_store::connector(config.remote_backend());
    if let Some(connect) = &connector {
        match connect().await {
            Ok(store) => engine.install_remote(store).await,
            Err(err) => warn!(error = %err, "remote store unavailable at startup"),
        }
    }

    let session = game_service::load_session(&config, &engine).await;
    let app_state = AppState::new(session, engine.clone());
    game_service::start(&app_state).await;

    if let Some(connect) = connector {
        tokio::spawn(storage_supervisor::run(engine, move || connect()));
    }
    let maintenance_tasks = maintenance::spawn(&app_state);

    let app = build_router(app_state.clone());

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    let server = async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(shutdown_signal())
            .await
    };

    match game_service::supervise(&app_state, maintenance_tasks, server).await {
        Ok(served) => served.context("serving axum"),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => Err(err).context("server task stopped"),
    }
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
