//! Player-facing operations: session bootstrap, client message handling,
//! disconnects and the final save on shutdown.

use std::{future::Future, time::SystemTime};

use axum::extract::ws::Message;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::persistence::PersistenceEngine,
    dto::ws::{ClientMessage, ServerMessage},
    error::ServiceError,
    services::{admin_service, websocket_service::send_message_to_websocket},
    state::{
        SharedState,
        auditor::AuditReport,
        scheduler::ConnectionId,
        session::{GameSession, Outcome, SessionError},
    },
};

/// Load the newest usable snapshot, or start a fresh session from the roster.
pub async fn load_session(config: &AppConfig, engine: &PersistenceEngine) -> GameSession {
    match engine.load().await {
        Some((source, document)) => {
            info!(
                source = ?source,
                table_number = document.counters.table_number,
                seats = document.players.len(),
                "restoring game session"
            );
            GameSession::restore(config.ledger(), document)
        }
        None => {
            info!("no snapshot found; starting a fresh game session");
            GameSession::new(config.ledger())
        }
    }
}

/// Run the integrity audit once and write the starting snapshot.
pub async fn start(state: &SharedState) -> AuditReport {
    let report = state
        .transition(|session, now| {
            let (report, mut outcome) = session.audit(now);
            outcome.save = true;
            (report, outcome)
        })
        .await;
    if !report.is_clean() {
        warn!(report = ?report, "startup audit repaired the restored session");
    }
    report
}

/// Process one message from a client connection. Refusals go back to the
/// sender as `rejected` notices.
pub async fn handle_message(state: &SharedState, connection: ConnectionId, message: ClientMessage) {
    let action = message.action();
    debug!(connection = %connection, action, "client message");
    if let Err(err) = route_message(state, connection, message).await {
        reject(state, connection, action, err).await;
    }
}

async fn route_message(
    state: &SharedState,
    connection: ConnectionId,
    message: ClientMessage,
) -> Result<(), ServiceError> {
    let message = match message {
        ClientMessage::Authenticate {
            display_name,
            credential,
        } => return authenticate(state, connection, &display_name, &credential).await,
        ClientMessage::Ping => {
            state.send_to_connection(&connection, &ServerMessage::Pong);
            return Ok(());
        }
        other => other,
    };

    let account = state
        .connection_account(&connection)
        .ok_or(SessionError::NotAuthenticated)?;

    match message {
        ClientMessage::Join => {
            state
                .try_transition(|session, now| session.join(&account, Some(connection), now))
                .await?
        }
        ClientMessage::Reveal { tile_index } => {
            state
                .try_transition(|session, now| session.reveal(Some(&account), tile_index, now))
                .await?
        }
        ClientMessage::Leave => {
            state
                .transition(|session, now| ((), session.leave(&account, now)))
                .await
        }
        ClientMessage::Sync => {
            state
                .try_transition(|session, _| session.sync(&account))
                .await?
        }
        ClientMessage::CheckTableStatus => {
            state
                .try_transition(|session, _| session.check_table_status(&account))
                .await?
        }
        ClientMessage::ResetRowSelections => {
            state
                .try_transition(|session, _| session.reset_row_selections(&account))
                .await?
        }
        ClientMessage::SaveResumableState => {
            state
                .try_transition(|session, now| session.save_resumable_state(&account, now))
                .await?
        }
        admin => admin_service::handle(state, connection, &account, admin).await?,
    }
    Ok(())
}

async fn authenticate(
    state: &SharedState,
    connection: ConnectionId,
    display_name: &str,
    credential: &str,
) -> Result<(), ServiceError> {
    let summary = state
        .transition(|session, _| {
            let result = session.authenticate(display_name, credential);
            if let Ok(summary) = &result {
                session.rebind_connection(&summary.id, connection);
            }
            (result, Outcome::default())
        })
        .await?;

    let token = Uuid::new_v4();
    let replaced = state.bind_account(connection, &summary.id, summary.is_privileged, token);
    for previous in replaced {
        info!(account_id = %summary.id, connection = %previous.id, "closing replaced session");
        send_message_to_websocket(
            &previous.tx,
            &ServerMessage::SessionClosed {
                reason: "signed in from another connection".into(),
            },
        );
        if previous.tx.send(Message::Close(None)).is_err() {
            trace!(connection = %previous.id, "writer closed; close frame dropped");
        }
    }

    info!(account_id = %summary.id, privileged = summary.is_privileged, "account authenticated");
    let is_privileged = summary.is_privileged;
    let account_id = summary.id.clone();
    state.send_to_connection(
        &connection,
        &ServerMessage::Authenticated {
            token,
            account: summary,
        },
    );
    if is_privileged {
        admin_service::send_roster(state, connection, &account_id).await?;
    }
    Ok(())
}

async fn reject(state: &SharedState, connection: ConnectionId, action: &str, err: ServiceError) {
    debug!(connection = %connection, action, reason = %err, "client action rejected");
    state.send_to_connection(
        &connection,
        &ServerMessage::Rejected {
            action: action.to_string(),
            reason: err.to_string(),
        },
    );

    let ServiceError::Session(err) = err else {
        return;
    };
    if !err.needs_refresh() {
        return;
    }
    if let Some(account) = state.connection_account(&connection) {
        if let Err(err) = state
            .try_transition(|session, _| session.sync(&account))
            .await
        {
            warn!(account_id = %account, error = %err, "refresh after rejection failed");
        }
    }
}

/// Release a connection; the owning seat becomes disconnected unless it was
/// already rebound to a newer connection.
pub async fn disconnect(state: &SharedState, connection: ConnectionId) {
    state.remove_connection(&connection);
    state
        .transition(|session, now| ((), session.disconnect(connection, now)))
        .await;
}

/// Cancel pending turn work, flush queued changes and write a final snapshot.
pub async fn shutdown(state: &SharedState) {
    state.tasks().cancel_all();
    state.writer().flush().await;
    let document = state
        .read_session(|session| session.to_document(SystemTime::now()))
        .await;
    match state.writer().save_and_wait(document).await {
        Some(report) if report.is_durable() => {
            info!(remote = report.remote, local = ?report.local, "final snapshot saved")
        }
        _ => error!("final snapshot could not be saved"),
    }
}

/// Run the server in its own task and write the final snapshot however it
/// ends: clean stop, error or panic. Background loops are aborted first.
pub async fn supervise<T>(
    state: &SharedState,
    background: Vec<JoinHandle<()>>,
    server: impl Future<Output = T> + Send + 'static,
) -> Result<T, JoinError>
where
    T: Send + 'static,
{
    let outcome = tokio::spawn(server).await;
    if let Err(err) = &outcome {
        error!(error = %err, panicked = err.is_panic(), "server task failed");
    }
    for task in background {
        task.abort();
    }
    shutdown(state).await;
    outcome
}
