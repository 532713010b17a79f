use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    dto::{
        admin::{
            AccountTarget, ChangeCredentialRequest, RenameAccountRequest, ScoreDeltaRequest,
            SetScoreRequest,
        },
        game::{
            AccountSummary, ConnectionView, GameStateView, RosterEntry, TablesStatus,
            TileRevealedEvent, TileView,
        },
    },
    state::ledger::AccountId,
};

#[derive(Debug, Clone, Deserialize, Serialize)]
/// Messages accepted from participant WebSocket clients.
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        display_name: String,
        credential: String,
    },
    Join,
    Reveal {
        tile_index: usize,
    },
    Leave,
    Sync,
    CheckTableStatus,
    ResetRowSelections,
    SaveResumableState,
    Ping,
    AdminListAccounts,
    AdminUpdateScore(ScoreDeltaRequest),
    AdminSetScore(SetScoreRequest),
    AdminToggleBlock(AccountTarget),
    AdminUnlockScore(AccountTarget),
    AdminRecharge(AccountTarget),
    AdminResetAccountQuota(AccountTarget),
    AdminRenameAccount(RenameAccountRequest),
    AdminChangeCredential(ChangeCredentialRequest),
    AdminResetTableQuotas,
    AdminResetGame,
}

impl ClientMessage {
    /// Parse a text frame.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Short name used in logs and rejection notices.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Join => "join",
            Self::Reveal { .. } => "reveal",
            Self::Leave => "leave",
            Self::Sync => "sync",
            Self::CheckTableStatus => "check_table_status",
            Self::ResetRowSelections => "reset_row_selections",
            Self::SaveResumableState => "save_resumable_state",
            Self::Ping => "ping",
            Self::AdminListAccounts => "admin_list_accounts",
            Self::AdminUpdateScore(_) => "admin_update_score",
            Self::AdminSetScore(_) => "admin_set_score",
            Self::AdminToggleBlock(_) => "admin_toggle_block",
            Self::AdminUnlockScore(_) => "admin_unlock_score",
            Self::AdminRecharge(_) => "admin_recharge",
            Self::AdminResetAccountQuota(_) => "admin_reset_account_quota",
            Self::AdminRenameAccount(_) => "admin_rename_account",
            Self::AdminChangeCredential(_) => "admin_change_credential",
            Self::AdminResetTableQuotas => "admin_reset_table_quotas",
            Self::AdminResetGame => "admin_reset_game",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Messages pushed to participant WebSocket clients.
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Authenticated {
        token: Uuid,
        account: AccountSummary,
    },
    GameState(GameStateView),
    TileRevealed(TileRevealedEvent),
    ConnectionStatus {
        players: Vec<ConnectionView>,
    },
    TurnTimeout {
        account_id: AccountId,
        display_name: String,
    },
    SelectionsCompleted {
        account_id: AccountId,
    },
    SelectionProgress {
        revealed_this_cycle: u32,
        completed: bool,
    },
    ScoreLocked {
        account_id: AccountId,
        score: i64,
    },
    ScoreUnlocked {
        account_id: AccountId,
        score: i64,
    },
    BlockStatus {
        is_manually_blocked: bool,
        is_score_locked: bool,
    },
    ScoreUpdate {
        account_id: AccountId,
        score: i64,
    },
    TablesUpdate(TablesStatus),
    TableCycleAdvanced {
        table_number: u32,
        board: Vec<TileView>,
    },
    GameReset,
    Notice {
        message: String,
    },
    Roster {
        accounts: Vec<RosterEntry>,
    },
    SessionClosed {
        reason: String,
    },
    Rejected {
        action: String,
        reason: String,
    },
    AdminResult {
        action: String,
        success: bool,
    },
    Pong,
}

impl ServerMessage {
    /// Notice helper.
    pub fn notice(message: impl Into<String>) -> Self {
        Self::Notice {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_client_messages() {
        let join = ClientMessage::from_json_str(r#"{"type":"join"}"#).unwrap();
        assert!(matches!(join, ClientMessage::Join));

        let reveal = ClientMessage::from_json_str(r#"{"type":"reveal","tile_index":7}"#).unwrap();
        assert!(matches!(reveal, ClientMessage::Reveal { tile_index: 7 }));

        let rename = ClientMessage::from_json_str(
            r#"{"type":"admin_rename_account","account_id":"3","new_name":"Garza"}"#,
        )
        .unwrap();
        match rename {
            ClientMessage::AdminRenameAccount(request) => {
                assert_eq!(request.account_id, "3");
                assert_eq!(request.new_name, "Garza");
            }
            other => panic!("unexpected message {other:?}"),
        }

        assert!(ClientMessage::from_json_str(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn server_messages_are_tagged() {
        let value = serde_json::to_value(ServerMessage::ScoreUpdate {
            account_id: "1".into(),
            score: 45_000,
        })
        .unwrap();
        assert_eq!(value["type"], "score_update");
        assert_eq!(value["score"], 45_000);

        let value = serde_json::to_value(ServerMessage::GameReset).unwrap();
        assert_eq!(value["type"], "game_reset");
    }
}
