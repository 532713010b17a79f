//! Admin operations carried over the WebSocket channel. Every operation is
//! validated, then runs as a single session transition.

use tracing::info;
use validator::Validate;

use crate::{
    dto::ws::{ClientMessage, ServerMessage},
    error::ServiceError,
    state::{
        SharedState,
        ledger::AccountId,
        scheduler::ConnectionId,
        session::Outcome,
    },
};

/// Run one admin message on behalf of `caller` and acknowledge it.
pub async fn handle(
    state: &SharedState,
    connection: ConnectionId,
    caller: &AccountId,
    message: ClientMessage,
) -> Result<(), ServiceError> {
    let action = message.action();
    match message {
        ClientMessage::AdminListAccounts => return send_roster(state, connection, caller).await,
        ClientMessage::AdminUpdateScore(request) => {
            request.validate()?;
            state
                .try_transition(|session, now| {
                    session.admin_update_score(caller, &request.account_id, request.delta, now)
                })
                .await?;
        }
        ClientMessage::AdminSetScore(request) => {
            request.validate()?;
            state
                .try_transition(|session, now| {
                    session.admin_set_score(caller, &request.account_id, request.value, now)
                })
                .await?;
        }
        ClientMessage::AdminToggleBlock(target) => {
            target.validate()?;
            state
                .try_transition(|session, now| {
                    session.admin_toggle_block(caller, &target.account_id, now)
                })
                .await?;
        }
        ClientMessage::AdminUnlockScore(target) => {
            target.validate()?;
            state
                .try_transition(|session, now| {
                    session.admin_unlock_score(caller, &target.account_id, now)
                })
                .await?;
        }
        ClientMessage::AdminRecharge(target) => {
            target.validate()?;
            state
                .try_transition(|session, now| {
                    session.admin_recharge(caller, &target.account_id, now)
                })
                .await?;
        }
        ClientMessage::AdminResetAccountQuota(target) => {
            target.validate()?;
            state
                .try_transition(|session, _| {
                    session.admin_reset_account_quota(caller, &target.account_id)
                })
                .await?;
        }
        ClientMessage::AdminRenameAccount(request) => {
            request.validate()?;
            state
                .try_transition(|session, _| {
                    session.admin_rename(caller, &request.account_id, request.new_name.trim())
                })
                .await?;
        }
        ClientMessage::AdminChangeCredential(request) => {
            request.validate()?;
            state
                .try_transition(|session, _| {
                    session.admin_change_credential(
                        caller,
                        &request.account_id,
                        &request.new_credential,
                    )
                })
                .await?;
        }
        ClientMessage::AdminResetTableQuotas => {
            state
                .try_transition(|session, _| session.admin_reset_table_quotas(caller))
                .await?;
        }
        ClientMessage::AdminResetGame => {
            state
                .try_transition(|session, now| session.admin_reset_game(caller, now))
                .await?;
        }
        other => {
            return Err(ServiceError::InvalidInput(format!(
                "`{}` is not an admin action",
                other.action()
            )));
        }
    }

    info!(account_id = %caller, action, "admin action applied");
    state.send_to_connection(
        &connection,
        &ServerMessage::AdminResult {
            action: action.to_string(),
            success: true,
        },
    );
    Ok(())
}

/// Send the non-privileged roster to an admin connection.
pub async fn send_roster(
    state: &SharedState,
    connection: ConnectionId,
    caller: &AccountId,
) -> Result<(), ServiceError> {
    let accounts = state
        .transition(|session, _| (session.admin_list_accounts(caller), Outcome::default()))
        .await?;
    state.send_to_connection(&connection, &ServerMessage::Roster { accounts });
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::ws::Message;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{local_store::LocalSnapshotStore, persistence::PersistenceEngine},
        dto::admin::{AccountTarget, ChangeCredentialRequest, ScoreDeltaRequest},
        state::{AppState, session::GameSession},
    };

    fn setup(
        dir: &tempfile::TempDir,
    ) -> (SharedState, ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let config = AppConfig::default();
        let engine = Arc::new(PersistenceEngine::new(LocalSnapshotStore::new(dir.path())));
        let state = AppState::new(GameSession::new(config.ledger()), engine);
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        state.register_connection(id, tx);
        state.bind_account(id, &"admin".to_string(), true, Uuid::new_v4());
        (state, id, rx)
    }

    fn types(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            out.push(value["type"].as_str().unwrap_or_default().to_string());
        }
        out
    }

    #[tokio::test]
    async fn score_update_is_acknowledged_and_applied() {
        let dir = tempfile::tempdir().unwrap();
        let (state, connection, mut rx) = setup(&dir);
        handle(
            &state,
            connection,
            &"admin".to_string(),
            ClientMessage::AdminUpdateScore(ScoreDeltaRequest {
                account_id: "4".into(),
                delta: -40_000,
            }),
        )
        .await
        .unwrap();

        let types = types(&mut rx);
        assert!(types.contains(&"roster".to_string()));
        assert_eq!(types.last().map(String::as_str), Some("admin_result"));
        let account = state
            .read_session(|s| s.ledger().get("4").cloned())
            .await
            .unwrap();
        assert_eq!(account.score, 20_000);
        assert!(account.is_score_locked);
    }

    #[tokio::test]
    async fn invalid_payloads_never_reach_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let (state, connection, _rx) = setup(&dir);
        let err = handle(
            &state,
            connection,
            &"admin".to_string(),
            ClientMessage::AdminChangeCredential(ChangeCredentialRequest {
                account_id: "1".into(),
                new_credential: "123".into(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn players_cannot_run_admin_actions() {
        let dir = tempfile::tempdir().unwrap();
        let (state, connection, _rx) = setup(&dir);
        let err = handle(
            &state,
            connection,
            &"1".to_string(),
            ClientMessage::AdminToggleBlock(AccountTarget {
                account_id: "2".into(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Session(crate::state::session::SessionError::Unauthorized)
        ));
    }
}
