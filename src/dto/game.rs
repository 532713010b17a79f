use serde::{Deserialize, Serialize};

use crate::{
    dto::epoch_millis,
    state::{
        board::{Board, Tile},
        ledger::{Account, AccountId},
        scheduler::PlayerSlot,
        session::SessionStatus,
    },
};

/// Tile as shown to participants; unrevealed values are hidden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileView {
    pub value: Option<i64>,
    pub revealed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revealed_by: Option<AccountId>,
}

impl From<&Tile> for TileView {
    fn from(tile: &Tile) -> Self {
        Self {
            value: tile.revealed.then_some(tile.value),
            revealed: tile.revealed,
            revealed_by: tile.revealed_by.clone(),
        }
    }
}

/// Mask every unrevealed tile of the board.
pub fn masked_board(board: &Board) -> Vec<TileView> {
    board.tiles().iter().map(TileView::from).collect()
}

/// Seated player with the flags other participants see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerView {
    pub account_id: AccountId,
    pub display_name: String,
    pub is_connected: bool,
    pub is_manually_blocked: bool,
    pub is_score_locked: bool,
}

impl PlayerView {
    /// Combine a seat with its roster entry.
    pub fn new(slot: &PlayerSlot, account: Option<&Account>) -> Self {
        Self {
            account_id: slot.account_id.clone(),
            display_name: slot.display_name.clone(),
            is_connected: slot.is_connected,
            is_manually_blocked: account.is_some_and(|a| a.is_manually_blocked),
            is_score_locked: account.is_some_and(|a| a.is_score_locked),
        }
    }
}

/// Why a full snapshot was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotReason {
    ResetCompleted,
    Resync,
}

/// Full masked game snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameStateView {
    pub board: Vec<TileView>,
    pub current_player: Option<PlayerView>,
    pub players: Vec<PlayerView>,
    pub status: SessionStatus,
    pub turn_started_at_ms: Option<u64>,
    pub table_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SnapshotReason>,
}

/// Seat connectivity delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionView {
    pub account_id: AccountId,
    pub display_name: String,
    pub is_connected: bool,
}

impl From<&PlayerSlot> for ConnectionView {
    fn from(slot: &PlayerSlot) -> Self {
        Self {
            account_id: slot.account_id.clone(),
            display_name: slot.display_name.clone(),
            is_connected: slot.is_connected,
        }
    }
}

/// Broadcast after a successful reveal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileRevealedEvent {
    pub tile_index: usize,
    pub value: i64,
    pub revealed_by: AccountId,
    pub display_name: String,
    pub score: i64,
    pub board: Vec<TileView>,
}

/// Account summary returned on login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountSummary {
    pub id: AccountId,
    pub display_name: String,
    pub score: i64,
    pub is_privileged: bool,
    pub is_manually_blocked: bool,
    pub is_score_locked: bool,
    pub selections_completed: bool,
}

/// Roster line shown to admins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    pub id: AccountId,
    pub display_name: String,
    pub score: i64,
    pub is_manually_blocked: bool,
    pub is_score_locked: bool,
    pub tables_played: u32,
}

/// Per-account quota status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TablesStatus {
    pub tables_played: u32,
    pub current_table: u32,
    pub max_reached: bool,
}

/// Timestamp helper for views.
pub fn view_time(time: Option<std::time::SystemTime>) -> Option<u64> {
    time.map(epoch_millis)
}
