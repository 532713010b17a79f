//! The authoritative game session and every transition that mutates it.
//!
//! Transitions are synchronous and run one at a time under the session gate
//! held by [`crate::state::AppState`]. Each returns an [`Outcome`] describing
//! the messages to deliver, the turn task to (re)schedule and what to persist;
//! the caller dispatches it before releasing the gate.

use std::time::{Duration, SystemTime};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info};

use crate::{
    dao::models::{DOCUMENT_VERSION, FieldUpdates, SessionDocument},
    dto::{
        game::{
            AccountSummary, ConnectionView, GameStateView, PlayerView, RosterEntry,
            SnapshotReason, TablesStatus, TileRevealedEvent, TileView, masked_board, view_time,
        },
        health::SummaryResponse,
        ws::ServerMessage,
    },
    state::{
        board::{Board, sanitize_value},
        ledger::{Account, AccountId, LedgerError, LockChange, ScoreChange, ScoreLedger},
        scheduler::{
            ADVANCE_AFTER_LEAVE, ADVANCE_AFTER_REVEAL, ConnectionId, NO_ELIGIBLE_RETRY,
            PlayerSlot, TIMEOUT_GRACE, TURN_DURATION, TurnDecision, TurnScheduler,
        },
        selections::{MAX_SELECTIONS, SelectionTracker},
    },
};

/// Highest table cycle number before wrapping back to 1.
pub const MAX_CYCLE: u32 = 10;
/// Tables an account may play per reset period.
pub const MAX_TABLES_PER_DAY: u32 = 10;
/// Pause between a full reset and the first turn.
pub const RESET_RESUME_DELAY: Duration = Duration::from_secs(2);
/// Resumable states older than this are dropped.
pub const RESUMABLE_STATE_TTL: Duration = Duration::from_secs(60 * 60);

/// Coarse session status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Turns are running.
    #[default]
    Playing,
    /// A full reset is settling before play resumes.
    Resetting,
}

impl SessionStatus {
    /// Lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Playing => "playing",
            Self::Resetting => "resetting",
        }
    }
}

/// Cycle and quota counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    /// Current cycle, in `1..=MAX_CYCLE`.
    pub table_number: u32,
    /// Tables completed per account since the last quota reset.
    #[serde(default)]
    pub tables_played: IndexMap<AccountId, u32>,
    /// Tables completed by everyone since the last quota reset.
    #[serde(default)]
    pub total_tables_played: u64,
    /// Date of the last quota reset.
    #[serde(default)]
    pub last_reset_date: Option<String>,
}

impl Default for SessionCounters {
    fn default() -> Self {
        Self {
            table_number: 1,
            tables_played: IndexMap::new(),
            total_tables_played: 0,
            last_reset_date: None,
        }
    }
}

/// What a player sees again when they come back after leaving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumableState {
    /// Board as it looked when the player left, values masked.
    pub board: Vec<TileView>,
    /// Score at the time of leaving.
    pub score: i64,
    /// Score before the last mutation.
    pub previous_score: i64,
    /// Tiles revealed in the running cycle.
    pub selections_this_cycle: u32,
    /// Whether the selection latch was set.
    pub selections_completed: bool,
    /// Tables completed since the last quota reset.
    pub tables_played: u32,
    /// When the state was stored; drives the inactivity cleanup.
    pub stored_at: SystemTime,
}

/// Recipients of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Every live connection.
    Everyone,
    /// The live connection of one account.
    Account(AccountId),
    /// Live connections of privileged accounts.
    Admins,
}

/// A message with its recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Who receives the message.
    pub audience: Audience,
    /// Payload to deliver.
    pub message: ServerMessage,
}

/// Turn-related work to run later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnAction {
    /// The running turn ran out of time.
    Expire,
    /// Rotate to the next eligible player.
    Advance,
    /// Leave the reset status and start a turn.
    Resume,
}

/// Scheduling request for the single turn task.
///
/// Issuing a command supersedes every earlier one; the epoch lets the task
/// detect that it was superseded after it already woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnCommand {
    /// Turn epoch the task belongs to.
    pub epoch: u64,
    /// Work to run once the delay elapsed.
    pub action: TurnAction,
    /// Wait before running.
    pub delay: Duration,
}

/// Side effects of one transition.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Messages in delivery order.
    pub messages: Vec<Dispatch>,
    /// Replacement for the pending turn task.
    pub turn: Option<TurnCommand>,
    /// Whether a full durable save is required.
    pub save: bool,
    /// Low-priority field changes for the debounced queue.
    pub differential: FieldUpdates,
    /// Field changes written to the remote store right away.
    pub immediate: FieldUpdates,
}

impl Outcome {
    pub(super) fn send(&mut self, audience: Audience, message: ServerMessage) {
        self.messages.push(Dispatch { audience, message });
    }

    pub(super) fn broadcast(&mut self, message: ServerMessage) {
        self.send(Audience::Everyone, message);
    }

    pub(super) fn to(&mut self, account_id: &str, message: ServerMessage) {
        self.send(Audience::Account(account_id.to_string()), message);
    }

    pub(super) fn queue<T: Serialize>(&mut self, path: impl Into<String>, value: T) {
        self.differential.insert(path.into(), json(value));
    }

    pub(super) fn write_now<T: Serialize>(&mut self, path: impl Into<String>, value: T) {
        self.immediate.insert(path.into(), json(value));
    }

    /// Append another outcome, keeping message order and the latest turn command.
    pub fn merge(&mut self, other: Outcome) {
        self.messages.extend(other.messages);
        if other.turn.is_some() {
            self.turn = other.turn;
        }
        self.save |= other.save;
        self.differential.extend(other.differential);
        self.immediate.extend(other.immediate);
    }
}

fn json<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Reasons a transition is refused. State is left untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// No account is bound to the caller.
    #[error("not authenticated")]
    NotAuthenticated,
    /// Display name and credential do not match.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// The caller is not privileged.
    #[error("admin privileges required")]
    Unauthorized,
    /// No account with this id.
    #[error("account `{0}` not found")]
    UnknownAccount(AccountId),
    /// Admin accounts never reveal tiles.
    #[error("admin accounts cannot play")]
    PrivilegedCannotPlay,
    /// Blocked by an admin.
    #[error("account blocked by an admin")]
    ManuallyBlocked,
    /// Score at or below the lock threshold.
    #[error("account locked by its score")]
    ScoreLocked,
    /// Daily table quota used up.
    #[error("daily table limit reached")]
    TableLimitReached,
    /// Selections latched for this session.
    #[error("selections already completed")]
    SelectionsCompleted,
    /// Another player holds the turn.
    #[error("not your turn")]
    NotYourTurn,
    /// The turn ran past its duration.
    #[error("turn time expired")]
    TurnExpired,
    /// Index past the end of the board.
    #[error("tile {0} does not exist")]
    TileOutOfRange(usize),
    /// Tile already turned over.
    #[error("tile {0} already revealed")]
    TileAlreadyRevealed(usize),
    /// No selections left this cycle.
    #[error("selection limit reached")]
    SelectionLimitReached,
    /// Roster edit refused by the ledger.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl SessionError {
    /// The caller's view is stale and should be refreshed.
    pub fn needs_refresh(&self) -> bool {
        matches!(self, Self::TileAlreadyRevealed(_))
    }
}

fn slot_is_eligible(ledger: &ScoreLedger, selections: &SelectionTracker, slot: &PlayerSlot) -> bool {
    slot.is_connected
        && ledger
            .get(&slot.account_id)
            .is_some_and(Account::can_play)
        && !selections.is_latched(&slot.account_id)
}

/// Board, seats, selections, counters and turn of the single shared session.
#[derive(Debug, Clone)]
pub struct GameSession {
    pub(super) ledger: ScoreLedger,
    pub(super) board: Board,
    pub(super) slots: Vec<PlayerSlot>,
    pub(super) selections: SelectionTracker,
    pub(super) counters: SessionCounters,
    pub(super) scheduler: TurnScheduler,
    pub(super) status: SessionStatus,
    pub(super) resumable: IndexMap<AccountId, ResumableState>,
    turn_epoch: u64,
}

impl GameSession {
    /// Fresh session over the given roster.
    pub fn new(ledger: ScoreLedger) -> Self {
        Self {
            ledger,
            board: Board::generate(),
            slots: Vec::new(),
            selections: SelectionTracker::default(),
            counters: SessionCounters::default(),
            scheduler: TurnScheduler::default(),
            status: SessionStatus::Playing,
            resumable: IndexMap::new(),
            turn_epoch: 0,
        }
    }

    /// Rebuild a session from a persisted document.
    ///
    /// No connection survives a restart: every seat comes back disconnected
    /// and no turn is running.
    pub fn restore(mut ledger: ScoreLedger, document: SessionDocument) -> Self {
        ledger.restore_from(document.accounts.into_values());

        let mut slots: Vec<PlayerSlot> = Vec::with_capacity(document.players.len());
        for mut slot in document.players {
            if ledger.get(&slot.account_id).is_none()
                || slots.iter().any(|s| s.account_id == slot.account_id)
            {
                debug!(account_id = %slot.account_id, "dropping persisted seat");
                continue;
            }
            if let Some(account) = ledger.get(&slot.account_id) {
                slot.display_name = account.display_name.clone();
            }
            slot.connection = None;
            slot.is_connected = false;
            slots.push(slot);
        }

        let mut scheduler = TurnScheduler::restore(
            document.current_player_index,
            document.rotation_cursor,
            document.turn_started_at,
        );
        scheduler.clamp_to(slots.len());
        scheduler.clear();

        let mut counters = document.counters;
        counters.table_number = counters.table_number.clamp(1, MAX_CYCLE);

        Self {
            ledger,
            board: document.board,
            slots,
            selections: SelectionTracker::from_records(document.selections),
            counters,
            scheduler,
            status: SessionStatus::Playing,
            resumable: document.resumable,
            turn_epoch: 0,
        }
    }

    /// Serialize every persisted field.
    pub fn to_document(&self, now: SystemTime) -> SessionDocument {
        SessionDocument {
            version: DOCUMENT_VERSION,
            board: self.board.clone(),
            players: self
                .slots
                .iter()
                .map(|slot| PlayerSlot {
                    connection: None,
                    ..slot.clone()
                })
                .collect(),
            selections: self.selections.records().clone(),
            counters: self.counters.clone(),
            current_player_index: self.scheduler.current(),
            rotation_cursor: self.scheduler.cursor(),
            status: self.status,
            turn_started_at: self.scheduler.turn_started_at(),
            accounts: self
                .ledger
                .iter()
                .map(|account| (account.id.clone(), account.clone()))
                .collect(),
            resumable: self.resumable.clone(),
            timestamp: now,
        }
    }

    /// Roster.
    pub fn ledger(&self) -> &ScoreLedger {
        &self.ledger
    }

    /// Current board.
    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Seats in seating order.
    pub fn slots(&self) -> &[PlayerSlot] {
        &self.slots
    }

    /// Selection records.
    pub fn selections(&self) -> &SelectionTracker {
        &self.selections
    }

    /// Cycle and quota counters.
    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    /// Turn bookkeeping.
    pub fn scheduler(&self) -> &TurnScheduler {
        &self.scheduler
    }

    /// Session status.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Stored resumable states.
    pub fn resumable(&self) -> &IndexMap<AccountId, ResumableState> {
        &self.resumable
    }

    /// Epoch of the latest turn command.
    pub fn turn_epoch(&self) -> u64 {
        self.turn_epoch
    }

    /// Account holding the turn.
    pub fn current_account(&self) -> Option<&AccountId> {
        self.scheduler.current_account(&self.slots)
    }

    /// Tables completed by an account since the last quota reset.
    pub fn tables_played(&self, id: &str) -> u32 {
        self.counters.tables_played.get(id).copied().unwrap_or(0)
    }

    /// Quota check with the last-cycle carve-out: on the final cycle an
    /// account sitting exactly at the quota may still finish.
    pub fn quota_blocks(&self, id: &str) -> bool {
        let played = self.tables_played(id);
        if self.counters.table_number == MAX_CYCLE && played == MAX_TABLES_PER_DAY {
            return false;
        }
        played > MAX_TABLES_PER_DAY
    }

    /// Read-only counters for the status surface.
    pub fn summary(&self) -> SummaryResponse {
        SummaryResponse {
            total_players: self.slots.len(),
            connected_players: self.slots.iter().filter(|s| s.is_connected).count(),
            revealed_tiles: self.board.revealed_count(),
            table_number: self.counters.table_number,
            status: self.status.as_str().to_string(),
        }
    }

    /// Full masked snapshot.
    pub fn snapshot_view(&self, reason: Option<SnapshotReason>) -> GameStateView {
        let player = |slot: &PlayerSlot| PlayerView::new(slot, self.ledger.get(&slot.account_id));
        GameStateView {
            board: masked_board(&self.board),
            current_player: self
                .scheduler
                .current()
                .and_then(|index| self.slots.get(index))
                .map(player),
            players: self.slots.iter().map(player).collect(),
            status: self.status,
            turn_started_at_ms: view_time(self.scheduler.turn_started_at()),
            table_number: self.counters.table_number,
            reason,
        }
    }

    pub(super) fn snapshot(&self) -> ServerMessage {
        ServerMessage::GameState(self.snapshot_view(None))
    }

    /// Non-privileged accounts as admins see them.
    pub fn roster(&self) -> Vec<RosterEntry> {
        self.ledger
            .iter()
            .filter(|account| !account.is_privileged)
            .map(|account| RosterEntry {
                id: account.id.clone(),
                display_name: account.display_name.clone(),
                score: account.score,
                is_manually_blocked: account.is_manually_blocked,
                is_score_locked: account.is_score_locked,
                tables_played: self.tables_played(&account.id),
            })
            .collect()
    }

    fn tables_status(&self, id: &str) -> TablesStatus {
        let tables_played = self.tables_played(id);
        TablesStatus {
            tables_played,
            current_table: self.counters.table_number,
            max_reached: tables_played > MAX_TABLES_PER_DAY
                || (tables_played == MAX_TABLES_PER_DAY
                    && self.counters.table_number != MAX_CYCLE),
        }
    }

    pub(super) fn block_status(account: &Account) -> ServerMessage {
        ServerMessage::BlockStatus {
            is_manually_blocked: account.is_manually_blocked,
            is_score_locked: account.is_score_locked,
        }
    }

    fn slot_index(&self, id: &str) -> Option<usize> {
        self.slots.iter().position(|slot| slot.account_id == id)
    }

    fn is_eligible_at(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot_is_eligible(&self.ledger, &self.selections, slot))
    }

    fn eligible_indices(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|index| self.is_eligible_at(*index))
            .collect()
    }

    fn turn_is_vacant(&self) -> bool {
        !self
            .scheduler
            .current()
            .and_then(|index| self.slots.get(index))
            .is_some_and(|slot| slot.is_connected)
    }

    fn account(&self, id: &str) -> Result<&Account, SessionError> {
        self.ledger.get(id).ok_or_else(|| {
            error!(account_id = %id, "transition for unknown account");
            SessionError::UnknownAccount(id.to_string())
        })
    }

    fn require_admin(&self, caller: &str) -> Result<(), SessionError> {
        match self.ledger.get(caller) {
            Some(account) if account.is_privileged => Ok(()),
            Some(_) => Err(SessionError::Unauthorized),
            None => Err(SessionError::NotAuthenticated),
        }
    }

    fn require_target(&self, id: &str) -> Result<&Account, SessionError> {
        self.ledger
            .get(id)
            .ok_or_else(|| SessionError::UnknownAccount(id.to_string()))
    }

    fn schedule_turn(&mut self, out: &mut Outcome, action: TurnAction, delay: Duration) {
        self.turn_epoch += 1;
        out.turn = Some(TurnCommand {
            epoch: self.turn_epoch,
            action,
            delay,
        });
    }

    fn queue_turn_fields(&self, out: &mut Outcome) {
        out.queue("current_player_index", self.scheduler.current());
        out.queue("rotation_cursor", self.scheduler.cursor());
        out.queue("status", self.status);
        out.queue("turn_started_at", self.scheduler.turn_started_at());
    }

    fn start_turn(&mut self, index: usize, now: SystemTime, out: &mut Outcome) {
        self.scheduler.select(index, now);
        self.status = SessionStatus::Playing;
        if let Some(slot) = self.slots.get(index) {
            info!(account_id = %slot.account_id, seat = index, "turn started");
            let id = slot.account_id.clone();
            self.selections.ensure(&id);
        }
        self.schedule_turn(out, TurnAction::Expire, TURN_DURATION);
        out.broadcast(self.snapshot());
        self.queue_turn_fields(out);
    }

    fn advance(&mut self, now: SystemTime, out: &mut Outcome) {
        let had_turn = self.scheduler.current().is_some();
        let decision = {
            let ledger = &self.ledger;
            let selections = &self.selections;
            self.scheduler.advance(&self.slots, now, |slot| {
                slot_is_eligible(ledger, selections, slot)
            })
        };
        match decision {
            TurnDecision::Selected(index) => self.start_turn(index, now, out),
            TurnDecision::NoneEligible => {
                debug!("no eligible player; retrying later");
                self.schedule_turn(out, TurnAction::Advance, NO_ELIGIBLE_RETRY);
                if had_turn {
                    out.broadcast(self.snapshot());
                    self.queue_turn_fields(out);
                }
            }
            TurnDecision::Retry => {
                self.schedule_turn(out, TurnAction::Advance, NO_ELIGIBLE_RETRY);
            }
        }
    }

    /// Run a scheduled turn task. Returns `None` when a newer command superseded it.
    pub fn run_turn_task(
        &mut self,
        epoch: u64,
        action: TurnAction,
        now: SystemTime,
    ) -> Option<Outcome> {
        if epoch != self.turn_epoch {
            debug!(epoch, current = self.turn_epoch, "ignoring stale turn task");
            return None;
        }
        let mut out = Outcome::default();
        match action {
            TurnAction::Expire => {
                if let Some(slot) = self
                    .scheduler
                    .current()
                    .and_then(|index| self.slots.get(index))
                {
                    info!(account_id = %slot.account_id, "turn timed out");
                    out.broadcast(ServerMessage::TurnTimeout {
                        account_id: slot.account_id.clone(),
                        display_name: slot.display_name.clone(),
                    });
                }
                self.schedule_turn(&mut out, TurnAction::Advance, TIMEOUT_GRACE);
            }
            TurnAction::Advance => self.advance(now, &mut out),
            TurnAction::Resume => {
                self.status = SessionStatus::Playing;
                match self.scheduler.current() {
                    Some(index) if self.is_eligible_at(index) => {
                        self.start_turn(index, now, &mut out)
                    }
                    _ => self.advance(now, &mut out),
                }
            }
        }
        Some(out)
    }

    /// Verify credentials and return the account summary.
    pub fn authenticate(
        &mut self,
        display_name: &str,
        credential: &str,
    ) -> Result<AccountSummary, SessionError> {
        let account = self
            .ledger
            .authenticate(display_name, credential)
            .ok_or(SessionError::InvalidCredentials)?
            .clone();
        self.selections.ensure(&account.id);
        Ok(AccountSummary {
            selections_completed: self.selections.is_latched(&account.id),
            id: account.id,
            display_name: account.display_name,
            score: account.score,
            is_privileged: account.is_privileged,
            is_manually_blocked: account.is_manually_blocked,
            is_score_locked: account.is_score_locked,
        })
    }

    /// Seat an account, or mark its existing seat connected again.
    pub fn join(
        &mut self,
        id: &str,
        connection: Option<ConnectionId>,
        now: SystemTime,
    ) -> Result<Outcome, SessionError> {
        let display_name = self.account(id)?.display_name.clone();
        self.selections.ensure(id);
        self.status = SessionStatus::Playing;
        let mut out = Outcome::default();

        let index = match self.slot_index(id) {
            None => {
                self.slots
                    .push(PlayerSlot::connected(id, display_name.clone(), connection));
                let index = self.slots.len() - 1;
                info!(account_id = %id, seat = index, "account seated");
                out.broadcast(ServerMessage::ConnectionStatus {
                    players: vec![ConnectionView::from(&self.slots[index])],
                });
                out.queue(format!("players/{index}"), &self.slots[index]);
                index
            }
            Some(index) => {
                let slot = &mut self.slots[index];
                let was_connected = slot.is_connected;
                slot.connection = connection;
                slot.is_connected = true;
                out.queue(format!("players/{index}/is_connected"), true);
                if !was_connected {
                    info!(account_id = %id, seat = index, "account reconnected");
                    out.broadcast(ServerMessage::ConnectionStatus {
                        players: vec![ConnectionView::from(&self.slots[index])],
                    });
                    out.broadcast(ServerMessage::notice(format!(
                        "{display_name} reconnected"
                    )));
                }
                index
            }
        };

        if self.turn_is_vacant() {
            if self.is_eligible_at(index) {
                self.start_turn(index, now, &mut out);
            } else {
                self.advance(now, &mut out);
            }
        } else {
            out.broadcast(self.snapshot());
        }

        if self.selections.is_latched(id) {
            out.to(
                id,
                ServerMessage::SelectionsCompleted {
                    account_id: id.to_string(),
                },
            );
        }
        out.queue("status", self.status);
        out.save = true;
        Ok(out)
    }

    /// Reveal a tile for `account_id`.
    ///
    /// Preconditions are checked in a fixed order and the first failure is
    /// returned without touching any state.
    pub fn reveal(
        &mut self,
        account_id: Option<&str>,
        tile_index: usize,
        now: SystemTime,
    ) -> Result<Outcome, SessionError> {
        let id = account_id.ok_or(SessionError::NotAuthenticated)?;
        let Some(account) = self.ledger.get(id) else {
            error!(account_id = %id, "reveal from unknown account");
            return Err(SessionError::NotAuthenticated);
        };
        if account.is_privileged {
            return Err(SessionError::PrivilegedCannotPlay);
        }
        if account.is_manually_blocked {
            return Err(SessionError::ManuallyBlocked);
        }
        if account.is_score_locked {
            return Err(SessionError::ScoreLocked);
        }
        if self.quota_blocks(id) {
            return Err(SessionError::TableLimitReached);
        }
        if self.selections.is_latched(id) {
            return Err(SessionError::SelectionsCompleted);
        }
        if self.slots.len() > 1 && !self.scheduler.is_current(&self.slots, id) {
            return Err(SessionError::NotYourTurn);
        }
        if self.scheduler.is_expired(now) {
            return Err(SessionError::TurnExpired);
        }
        let tile = self
            .board
            .tile(tile_index)
            .ok_or(SessionError::TileOutOfRange(tile_index))?;
        if tile.revealed {
            return Err(SessionError::TileAlreadyRevealed(tile_index));
        }
        if self.selections.count(id) >= MAX_SELECTIONS {
            return Err(SessionError::SelectionLimitReached);
        }
        self.ledger.check_delta(id, sanitize_value(tile.value))?;

        let display_name = account.display_name.clone();
        let value = self
            .board
            .reveal(tile_index, id, now)
            .ok_or(SessionError::TileAlreadyRevealed(tile_index))?;
        let recorded = self.selections.record_selection(id);
        let change = self.ledger.apply_delta(id, value)?;
        info!(
            account_id = %id,
            tile_index,
            value,
            score = change.score,
            selections = recorded.count,
            "tile revealed"
        );

        let mut out = Outcome::default();
        out.broadcast(ServerMessage::TileRevealed(TileRevealedEvent {
            tile_index,
            value,
            revealed_by: id.to_string(),
            display_name,
            score: change.score,
            board: masked_board(&self.board),
        }));
        out.to(
            id,
            ServerMessage::ScoreUpdate {
                account_id: id.to_string(),
                score: change.score,
            },
        );
        self.report_lock_change(&change, &mut out);
        out.write_now(format!("board/{tile_index}"), self.board.tile(tile_index));
        out.write_now(format!("selections/{id}"), self.selections.get(id));
        out.write_now(format!("accounts/{id}/score"), change.score);
        out.write_now(format!("accounts/{id}/previous_score"), change.previous_score);
        out.save = true;

        if recorded.just_latched {
            info!(account_id = %id, "selections completed");
            out.to(
                id,
                ServerMessage::SelectionsCompleted {
                    account_id: id.to_string(),
                },
            );
            if !self.board.all_revealed() {
                return Ok(out);
            }
        }

        if self.board.all_revealed() {
            self.complete_cycle(now, &mut out);
        } else if self.slots.len() > 1 {
            self.schedule_turn(&mut out, TurnAction::Advance, ADVANCE_AFTER_REVEAL);
        }
        Ok(out)
    }

    fn report_lock_change(&self, change: &ScoreChange, out: &mut Outcome) {
        let Some(lock_change) = change.lock_change else {
            return;
        };
        let id = change.account_id.as_str();
        let message = match lock_change {
            LockChange::Locked => ServerMessage::ScoreLocked {
                account_id: id.to_string(),
                score: change.score,
            },
            LockChange::Unlocked => ServerMessage::ScoreUnlocked {
                account_id: id.to_string(),
                score: change.score,
            },
        };
        out.to(id, message);
        if let Some(account) = self.ledger.get(id) {
            out.to(id, Self::block_status(account));
            out.write_now(
                format!("accounts/{id}/is_score_locked"),
                account.is_score_locked,
            );
        }
        out.send(Audience::Admins, ServerMessage::Roster {
            accounts: self.roster(),
        });
        out.save = true;
    }

    fn complete_cycle(&mut self, now: SystemTime, out: &mut Outcome) {
        let finishers: Vec<AccountId> = self
            .eligible_indices()
            .into_iter()
            .map(|index| self.slots[index].account_id.clone())
            .collect();
        for id in &finishers {
            let played = self.counters.tables_played.entry(id.clone()).or_insert(0);
            *played += 1;
            out.queue(format!("counters/tables_played/{id}"), *played);
        }
        self.counters.total_tables_played += finishers.len() as u64;
        out.queue(
            "counters/total_tables_played",
            self.counters.total_tables_played,
        );

        let turn_started = self.board_only_reset(now, out);
        if !turn_started && self.slots.len() > 1 {
            self.schedule_turn(out, TurnAction::Advance, ADVANCE_AFTER_REVEAL);
        }
    }

    /// Start the next cycle on a fresh board, keeping scores and latches.
    ///
    /// Returns whether a turn was started for a single eligible player.
    pub fn board_only_reset(&mut self, now: SystemTime, out: &mut Outcome) -> bool {
        self.counters.table_number = if self.counters.table_number >= MAX_CYCLE {
            1
        } else {
            self.counters.table_number + 1
        };
        self.board = Board::generate();
        self.selections.reset_all_cycles();
        for slot in &mut self.slots {
            slot.is_connected = slot.connection.is_some();
        }
        let seated: Vec<AccountId> = self.slots.iter().map(|s| s.account_id.clone()).collect();
        for id in &seated {
            self.selections.ensure(id);
        }
        info!(table_number = self.counters.table_number, "board regenerated");

        let mut turn_started = false;
        if let [only] = self.eligible_indices().as_slice() {
            self.start_turn(*only, now, out);
            turn_started = true;
        }

        out.broadcast(ServerMessage::TableCycleAdvanced {
            table_number: self.counters.table_number,
            board: masked_board(&self.board),
        });
        out.broadcast(self.snapshot());
        for slot in self.slots.iter().filter(|slot| slot.is_connected) {
            out.to(
                &slot.account_id,
                ServerMessage::TablesUpdate(self.tables_status(&slot.account_id)),
            );
        }
        out.save = true;
        turn_started
    }

    /// Reset everything to a fresh game. Play resumes after [`RESET_RESUME_DELAY`].
    pub fn full_reset(&mut self, now: SystemTime) -> Outcome {
        self.board = Board::generate();
        self.selections.clear();
        let seated: Vec<AccountId> = self.slots.iter().map(|s| s.account_id.clone()).collect();
        for id in &seated {
            self.selections.ensure(id);
        }
        self.counters.table_number = 1;
        for played in self.counters.tables_played.values_mut() {
            *played = 0;
        }
        self.counters.total_tables_played = 0;
        self.ledger.restore_all();
        self.resumable.clear();
        for slot in &mut self.slots {
            slot.is_connected = slot.connection.is_some();
        }

        self.status = SessionStatus::Resetting;
        self.scheduler.reset();
        if let Some(first) = self.eligible_indices().first().copied() {
            self.scheduler.assign(first);
        }
        info!(seats = self.slots.len(), "game fully reset");

        let mut out = Outcome::default();
        self.schedule_turn(&mut out, TurnAction::Resume, RESET_RESUME_DELAY);
        out.broadcast(ServerMessage::ConnectionStatus {
            players: self.slots.iter().map(ConnectionView::from).collect(),
        });
        out.broadcast(ServerMessage::GameState(
            self.snapshot_view(Some(SnapshotReason::ResetCompleted)),
        ));
        out.broadcast(ServerMessage::GameReset);
        for account in self.ledger.iter().filter(|a| !a.is_privileged) {
            out.to(
                &account.id,
                ServerMessage::ScoreUpdate {
                    account_id: account.id.clone(),
                    score: account.score,
                },
            );
            out.to(
                &account.id,
                ServerMessage::TablesUpdate(self.tables_status(&account.id)),
            );
            out.to(&account.id, Self::block_status(account));
        }
        out.broadcast(ServerMessage::notice("The game has been reset"));
        out.send(Audience::Admins, ServerMessage::Roster {
            accounts: self.roster(),
        });
        out.save = true;
        out
    }

    fn store_resumable(&mut self, id: &str, now: SystemTime) -> Option<ResumableState> {
        let account = self.ledger.get(id)?;
        let state = ResumableState {
            board: masked_board(&self.board),
            score: account.score,
            previous_score: account.previous_score,
            selections_this_cycle: self.selections.count(id),
            selections_completed: self.selections.is_latched(id),
            tables_played: self.tables_played(id),
            stored_at: now,
        };
        self.resumable.insert(id.to_string(), state.clone());
        Some(state)
    }

    /// Mark the account's seat disconnected and remember what it saw.
    pub fn leave(&mut self, id: &str, now: SystemTime) -> Outcome {
        let mut out = Outcome::default();
        let Some(index) = self.slot_index(id) else {
            return out;
        };
        let slot = &mut self.slots[index];
        slot.is_connected = false;
        slot.connection = None;
        info!(account_id = %id, seat = index, "account left");

        if let Some(state) = self.store_resumable(id, now) {
            out.queue(format!("resumable/{id}"), state);
        }
        out.broadcast(ServerMessage::ConnectionStatus {
            players: vec![ConnectionView::from(&self.slots[index])],
        });
        out.queue(format!("players/{index}/is_connected"), false);

        if self.scheduler.is_current(&self.slots, id) {
            self.schedule_turn(&mut out, TurnAction::Advance, ADVANCE_AFTER_LEAVE);
        }
        out
    }

    /// Drop a transport connection; only the seat it still owns is affected.
    pub fn disconnect(&mut self, connection: ConnectionId, now: SystemTime) -> Outcome {
        let owner = self
            .slots
            .iter()
            .find(|slot| slot.connection == Some(connection))
            .map(|slot| slot.account_id.clone());
        match owner {
            Some(id) => self.leave(&id, now),
            None => Outcome::default(),
        }
    }

    /// Point a seat at a replacement connection so closing the old one
    /// does not unseat the account.
    pub fn rebind_connection(&mut self, id: &str, connection: ConnectionId) -> bool {
        match self.slot_index(id) {
            Some(index) if self.slots[index].is_connected => {
                self.slots[index].connection = Some(connection);
                true
            }
            _ => false,
        }
    }

    /// Send the caller everything it needs to redraw.
    pub fn sync(&mut self, id: &str) -> Result<Outcome, SessionError> {
        let account = self.account(id)?.clone();
        self.selections.ensure(id);
        let mut view = self.snapshot_view(Some(SnapshotReason::Resync));
        if let Some(stored) = self.resumable.get(id) {
            view.board = stored.board.clone();
        }

        let mut out = Outcome::default();
        out.to(id, ServerMessage::GameState(view));
        out.to(
            id,
            ServerMessage::ScoreUpdate {
                account_id: id.to_string(),
                score: account.score,
            },
        );
        out.to(id, ServerMessage::TablesUpdate(self.tables_status(id)));
        if self.selections.is_latched(id) {
            out.to(
                id,
                ServerMessage::SelectionsCompleted {
                    account_id: id.to_string(),
                },
            );
        }
        if account.is_score_locked {
            out.to(
                id,
                ServerMessage::ScoreLocked {
                    account_id: id.to_string(),
                    score: account.score,
                },
            );
        }
        out.to(id, Self::block_status(&account));
        Ok(out)
    }

    /// Report the caller's quota status. Counts are never changed here; on
    /// the final cycle an account exactly at the quota is reported as still
    /// able to play.
    pub fn check_table_status(&mut self, id: &str) -> Result<Outcome, SessionError> {
        self.account(id)?;
        if self.counters.table_number == MAX_CYCLE && !self.quota_blocks(id) {
            debug!(
                account_id = %id,
                tables_played = self.tables_played(id),
                "quota open on the final cycle"
            );
        }
        self.sync(id)
    }

    /// Zero the caller's in-progress selections unless they latched.
    pub fn reset_row_selections(&mut self, id: &str) -> Result<Outcome, SessionError> {
        self.account(id)?;
        let mut out = Outcome::default();
        if self.selections.reset_cycle(id) {
            out.to(
                id,
                ServerMessage::SelectionProgress {
                    revealed_this_cycle: 0,
                    completed: false,
                },
            );
            out.queue(format!("selections/{id}"), self.selections.get(id));
        } else {
            out.to(
                id,
                ServerMessage::SelectionsCompleted {
                    account_id: id.to_string(),
                },
            );
        }
        Ok(out)
    }

    /// Store the caller's resumable state and save.
    pub fn save_resumable_state(
        &mut self,
        id: &str,
        now: SystemTime,
    ) -> Result<Outcome, SessionError> {
        self.account(id)?;
        self.store_resumable(id, now);
        Ok(Outcome {
            save: true,
            ..Outcome::default()
        })
    }

    /// Forget resumable states older than [`RESUMABLE_STATE_TTL`].
    pub fn cleanup_resumable(&mut self, now: SystemTime) -> Outcome {
        let before = self.resumable.len();
        self.resumable.retain(|_, state| {
            now.duration_since(state.stored_at)
                .map_or(true, |age| age <= RESUMABLE_STATE_TTL)
        });
        let removed = before - self.resumable.len();
        let mut out = Outcome::default();
        if removed > 0 {
            info!(removed, "dropped stale resumable states");
            out.save = true;
        }
        out
    }

    pub(super) fn after_eligibility_change(&mut self, id: &str, now: SystemTime, out: &mut Outcome) {
        let Some(index) = self.slot_index(id) else {
            return;
        };
        let eligible = self.is_eligible_at(index);
        if self.scheduler.current() == Some(index) && !eligible {
            self.schedule_turn(out, TurnAction::Advance, ADVANCE_AFTER_REVEAL);
        } else if eligible && self.turn_is_vacant() && self.status == SessionStatus::Playing {
            self.advance(now, out);
        }
    }

    fn score_changed(&mut self, change: ScoreChange, now: SystemTime) -> Outcome {
        let id = change.account_id.clone();
        let mut out = Outcome::default();
        out.to(
            &id,
            ServerMessage::ScoreUpdate {
                account_id: id.clone(),
                score: change.score,
            },
        );
        self.report_lock_change(&change, &mut out);
        out.write_now(format!("accounts/{id}/score"), change.score);
        out.write_now(format!("accounts/{id}/previous_score"), change.previous_score);
        out.send(Audience::Admins, ServerMessage::Roster {
            accounts: self.roster(),
        });
        out.broadcast(self.snapshot());
        out.save = true;
        self.after_eligibility_change(&id, now, &mut out);
        out
    }

    /// Admin: add `delta` to an account score.
    pub fn admin_update_score(
        &mut self,
        caller: &str,
        target: &str,
        delta: i64,
        now: SystemTime,
    ) -> Result<Outcome, SessionError> {
        self.require_admin(caller)?;
        self.require_target(target)?;
        let change = self.ledger.apply_delta(target, delta)?;
        Ok(self.score_changed(change, now))
    }

    /// Admin: overwrite an account score.
    pub fn admin_set_score(
        &mut self,
        caller: &str,
        target: &str,
        value: i64,
        now: SystemTime,
    ) -> Result<Outcome, SessionError> {
        self.require_admin(caller)?;
        self.require_target(target)?;
        let change = self.ledger.set_absolute(target, value)?;
        Ok(self.score_changed(change, now))
    }

    /// Admin: add the recharge amount and lift the manual block.
    pub fn admin_recharge(
        &mut self,
        caller: &str,
        target: &str,
        now: SystemTime,
    ) -> Result<Outcome, SessionError> {
        self.require_admin(caller)?;
        self.require_target(target)?;
        let change = self.ledger.recharge(target)?;
        let mut out = self.score_changed(change, now);
        out.to(target, ServerMessage::notice("An admin recharged your points"));
        if let Some(account) = self.ledger.get(target) {
            out.to(target, Self::block_status(account));
        }
        out.write_now(format!("accounts/{target}/is_manually_blocked"), false);
        Ok(out)
    }

    /// Admin: flip the manual block.
    pub fn admin_toggle_block(
        &mut self,
        caller: &str,
        target: &str,
        now: SystemTime,
    ) -> Result<Outcome, SessionError> {
        self.require_admin(caller)?;
        self.require_target(target)?;
        let blocked = self
            .ledger
            .toggle_manual_block(target)
            .ok_or_else(|| SessionError::UnknownAccount(target.to_string()))?;
        info!(account_id = %target, blocked, "manual block toggled");

        let mut out = Outcome::default();
        if let Some(account) = self.ledger.get(target) {
            out.to(target, Self::block_status(account));
        }
        out.to(
            target,
            ServerMessage::notice(if blocked {
                "Your account was blocked by an admin"
            } else {
                "Your account was unblocked by an admin"
            }),
        );
        out.write_now(format!("accounts/{target}/is_manually_blocked"), blocked);
        out.send(Audience::Admins, ServerMessage::Roster {
            accounts: self.roster(),
        });
        out.broadcast(self.snapshot());
        out.save = true;
        self.after_eligibility_change(target, now, &mut out);
        Ok(out)
    }

    /// Admin: clear the score lock until the next score evaluation.
    pub fn admin_unlock_score(
        &mut self,
        caller: &str,
        target: &str,
        now: SystemTime,
    ) -> Result<Outcome, SessionError> {
        self.require_admin(caller)?;
        self.require_target(target)?;
        self.ledger.set_score_lock(target, false);
        info!(account_id = %target, "score lock lifted by admin");

        let mut out = Outcome::default();
        if let Some(account) = self.ledger.get(target) {
            out.to(
                target,
                ServerMessage::ScoreUnlocked {
                    account_id: target.to_string(),
                    score: account.score,
                },
            );
            out.to(target, Self::block_status(account));
        }
        out.write_now(format!("accounts/{target}/is_score_locked"), false);
        out.send(Audience::Admins, ServerMessage::Roster {
            accounts: self.roster(),
        });
        out.save = true;
        self.after_eligibility_change(target, now, &mut out);
        Ok(out)
    }

    /// Admin: rename an account.
    pub fn admin_rename(
        &mut self,
        caller: &str,
        target: &str,
        new_name: &str,
    ) -> Result<Outcome, SessionError> {
        self.require_admin(caller)?;
        self.require_target(target)?;
        self.ledger.rename(target, new_name)?;
        let name = self
            .ledger
            .get(target)
            .map(|a| a.display_name.clone())
            .unwrap_or_default();
        let mut out = Outcome::default();
        if let Some(index) = self.slot_index(target) {
            self.slots[index].display_name = name.clone();
            out.queue(format!("players/{index}/display_name"), &name);
        }
        info!(account_id = %target, name = %name, "account renamed");
        out.send(Audience::Admins, ServerMessage::Roster {
            accounts: self.roster(),
        });
        out.broadcast(self.snapshot());
        out.save = true;
        Ok(out)
    }

    /// Admin: replace an account credential.
    pub fn admin_change_credential(
        &mut self,
        caller: &str,
        target: &str,
        secret: &str,
    ) -> Result<Outcome, SessionError> {
        self.require_admin(caller)?;
        self.require_target(target)?;
        self.ledger.change_credential(target, secret)?;
        info!(account_id = %target, "credential changed");
        Ok(Outcome {
            save: true,
            ..Outcome::default()
        })
    }

    /// Admin: zero every played-tables counter.
    pub fn admin_reset_table_quotas(&mut self, caller: &str) -> Result<Outcome, SessionError> {
        self.require_admin(caller)?;
        let players: Vec<AccountId> = self
            .ledger
            .iter()
            .filter(|a| !a.is_privileged)
            .map(|a| a.id.clone())
            .collect();
        for id in players {
            self.counters.tables_played.insert(id, 0);
        }
        self.counters.total_tables_played = 0;
        self.counters.last_reset_date = Some(OffsetDateTime::now_utc().date().to_string());
        info!("table quotas reset");

        let mut out = Outcome::default();
        out.broadcast(ServerMessage::notice("All tables have been unlocked"));
        for slot in self.slots.iter().filter(|slot| slot.is_connected) {
            out.to(
                &slot.account_id,
                ServerMessage::TablesUpdate(self.tables_status(&slot.account_id)),
            );
        }
        out.send(Audience::Admins, ServerMessage::Roster {
            accounts: self.roster(),
        });
        out.save = true;
        Ok(out)
    }

    /// Admin: zero one account's played-tables counter.
    pub fn admin_reset_account_quota(
        &mut self,
        caller: &str,
        target: &str,
    ) -> Result<Outcome, SessionError> {
        self.require_admin(caller)?;
        self.require_target(target)?;
        self.counters.tables_played.insert(target.to_string(), 0);
        let mut out = Outcome::default();
        out.to(target, ServerMessage::TablesUpdate(self.tables_status(target)));
        out.queue(format!("counters/tables_played/{target}"), 0);
        out.send(Audience::Admins, ServerMessage::Roster {
            accounts: self.roster(),
        });
        out.save = true;
        Ok(out)
    }

    /// Admin: list the roster.
    pub fn admin_list_accounts(&self, caller: &str) -> Result<Vec<RosterEntry>, SessionError> {
        self.require_admin(caller)?;
        Ok(self.roster())
    }

    /// Admin: fully reset the game.
    pub fn admin_reset_game(
        &mut self,
        caller: &str,
        now: SystemTime,
    ) -> Result<Outcome, SessionError> {
        self.require_admin(caller)?;
        Ok(self.full_reset(now))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::state::{
        board::{GAIN_VALUE, LOSS_VALUE, Tile},
        ledger::{LOCK_THRESHOLD, MAX_SCORE, STARTING_SCORE},
    };

    fn ledger() -> ScoreLedger {
        ScoreLedger::new([
            Account::new("1", "Condor", "vuela741", false),
            Account::new("2", "Colibri", "rapido852", false),
            Account::new("3", "Tucan", "colores963", false),
            Account::new("admin", "admin", "admin1998", true),
        ])
    }

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn alternating_board() -> Board {
        let tiles = (0..16)
            .map(|i| Tile {
                value: if i % 2 == 0 { GAIN_VALUE } else { LOSS_VALUE },
                revealed: false,
                revealed_by: None,
                revealed_at: None,
            })
            .collect();
        Board::from_tiles(tiles)
    }

    fn seated(ids: &[&str]) -> GameSession {
        let mut session = GameSession::new(ledger());
        session.board = alternating_board();
        for id in ids {
            session.join(id, Some(Uuid::new_v4()), t(0)).unwrap();
        }
        session
    }

    /// Run the pending turn command, ignoring its delay.
    fn fire(session: &mut GameSession, out: &Outcome, now: SystemTime) -> Outcome {
        let command = out.turn.expect("turn command");
        session
            .run_turn_task(command.epoch, command.action, now)
            .expect("fresh command")
    }

    fn hidden_tile(session: &GameSession, value: i64) -> usize {
        session
            .board
            .tiles()
            .iter()
            .position(|tile| !tile.revealed && tile.value == value)
            .unwrap()
    }

    #[test]
    fn first_eligible_join_takes_the_turn() {
        let mut session = GameSession::new(ledger());
        let out = session.join("1", Some(Uuid::new_v4()), t(0)).unwrap();
        assert_eq!(session.current_account().map(String::as_str), Some("1"));
        let command = out.turn.unwrap();
        assert_eq!(command.action, TurnAction::Expire);
        assert_eq!(command.delay, TURN_DURATION);
        assert!(out.save);

        let out = session.join("2", Some(Uuid::new_v4()), t(1)).unwrap();
        assert!(out.turn.is_none());
        assert_eq!(session.current_account().map(String::as_str), Some("1"));
        assert_eq!(session.slots().len(), 2);
    }

    #[test]
    fn join_is_idempotent() {
        let mut session = seated(&["1"]);
        session.join("1", Some(Uuid::new_v4()), t(1)).unwrap();
        assert_eq!(session.slots().len(), 1);
        assert_eq!(session.status(), SessionStatus::Playing);
    }

    #[test]
    fn admin_join_does_not_take_turn() {
        let mut session = GameSession::new(ledger());
        let out = session.join("admin", Some(Uuid::new_v4()), t(0)).unwrap();
        assert_eq!(session.current_account(), None);
        assert_eq!(out.turn.unwrap().action, TurnAction::Advance);
    }

    #[test]
    fn reveal_preconditions_are_ordered() {
        let mut session = seated(&["1", "2"]);
        assert_eq!(
            session.reveal(None, 0, t(1)).unwrap_err(),
            SessionError::NotAuthenticated
        );
        assert_eq!(
            session.reveal(Some("admin"), 0, t(1)).unwrap_err(),
            SessionError::PrivilegedCannotPlay
        );
        assert_eq!(
            session.reveal(Some("2"), 0, t(1)).unwrap_err(),
            SessionError::NotYourTurn
        );
        assert_eq!(
            session.reveal(Some("1"), 0, t(7)).unwrap_err(),
            SessionError::TurnExpired
        );
        assert_eq!(
            session.reveal(Some("1"), 16, t(1)).unwrap_err(),
            SessionError::TileOutOfRange(16)
        );

        session.ledger.toggle_manual_block("2");
        session.ledger.set_absolute("2", LOCK_THRESHOLD).unwrap();
        assert_eq!(
            session.reveal(Some("2"), 0, t(1)).unwrap_err(),
            SessionError::ManuallyBlocked
        );
        session.ledger.toggle_manual_block("2");
        assert_eq!(
            session.reveal(Some("2"), 0, t(1)).unwrap_err(),
            SessionError::ScoreLocked
        );
    }

    #[test]
    fn already_revealed_tile_requests_refresh() {
        let mut session = seated(&["1"]);
        session.reveal(Some("1"), 0, t(1)).unwrap();
        let err = session.reveal(Some("1"), 0, t(2)).unwrap_err();
        assert_eq!(err, SessionError::TileAlreadyRevealed(0));
        assert!(err.needs_refresh());
        assert_eq!(session.selections.count("1"), 1);
    }

    #[test]
    fn reveal_applies_value_and_advances_between_players() {
        let mut session = seated(&["1", "2"]);
        let out = session.reveal(Some("1"), 0, t(1)).unwrap();
        assert_eq!(session.ledger.get("1").unwrap().score, STARTING_SCORE + GAIN_VALUE);
        assert!(session.board.tile(0).unwrap().revealed);
        assert_eq!(
            session.board.tile(0).unwrap().revealed_by.as_deref(),
            Some("1")
        );
        assert!(matches!(
            out.messages[0].message,
            ServerMessage::TileRevealed(_)
        ));
        assert!(out.immediate.contains_key("board/0"));
        let command = out.turn.unwrap();
        assert_eq!(command.action, TurnAction::Advance);
        assert_eq!(command.delay, ADVANCE_AFTER_REVEAL);

        fire(&mut session, &out, t(2));
        assert_eq!(session.current_account().map(String::as_str), Some("2"));
    }

    #[test]
    fn score_lock_fires_exactly_once() {
        let mut session = seated(&["1"]);
        session.ledger.set_absolute("1", 25_000).unwrap();
        let loss = hidden_tile(&session, LOSS_VALUE);
        let out = session.reveal(Some("1"), loss, t(1)).unwrap();
        assert_eq!(session.ledger.get("1").unwrap().score, 9_000);
        assert!(session.ledger.get("1").unwrap().is_score_locked);
        let locks = out
            .messages
            .iter()
            .filter(|d| matches!(d.message, ServerMessage::ScoreLocked { .. }))
            .count();
        assert_eq!(locks, 1);
        assert_eq!(out.immediate["accounts/1/is_score_locked"], Value::Bool(true));
        assert_eq!(
            session.reveal(Some("1"), 2, t(2)).unwrap_err(),
            SessionError::ScoreLocked
        );
    }

    #[test]
    fn latched_player_is_never_selected_again() {
        let mut session = seated(&["1", "2"]);
        session.board = Board::from_tiles(
            (0..16)
                .map(|_| Tile {
                    value: GAIN_VALUE,
                    revealed: false,
                    revealed_by: None,
                    revealed_at: None,
                })
                .collect(),
        );
        let mut clock = 0;
        let mut tick = || {
            clock += 1;
            t(clock)
        };

        let mut latched = false;
        while !latched {
            let now = tick();
            let current = session.current_account().cloned().unwrap();
            let tile = hidden_tile(&session, GAIN_VALUE);
            let out = session.reveal(Some(&current), tile, now).unwrap();
            if current == "1" && session.selections.is_latched("1") {
                latched = true;
                assert!(out.turn.is_none());
                assert!(out.messages.iter().any(|d| d.audience
                    == Audience::Account("1".into())
                    && matches!(d.message, ServerMessage::SelectionsCompleted { .. })));
                let epoch = session.turn_epoch();
                let expired = session
                    .run_turn_task(epoch, TurnAction::Expire, tick())
                    .unwrap();
                fire(&mut session, &expired, tick());
            } else {
                fire(&mut session, &out, tick());
            }
        }

        assert_eq!(session.current_account().map(String::as_str), Some("2"));
        session.reset_row_selections("2").unwrap();
        for _ in 0..3 {
            assert_eq!(session.current_account().map(String::as_str), Some("2"));
            let tile = hidden_tile(&session, GAIN_VALUE);
            let out = session.reveal(Some("2"), tile, tick()).unwrap();
            fire(&mut session, &out, tick());
        }
        assert_eq!(
            session.reveal(Some("1"), 0, tick()).unwrap_err(),
            SessionError::SelectionsCompleted
        );
    }

    #[test]
    fn last_cycle_quota_override() {
        let mut session = seated(&["1"]);
        session.counters.table_number = MAX_CYCLE;
        session
            .counters
            .tables_played
            .insert("1".into(), MAX_TABLES_PER_DAY);
        assert!(!session.quota_blocks("1"));
        assert!(session.reveal(Some("1"), 0, t(1)).is_ok());

        session.counters.table_number = MAX_CYCLE - 1;
        assert!(!session.quota_blocks("1"));
        session
            .counters
            .tables_played
            .insert("1".into(), MAX_TABLES_PER_DAY + 1);
        assert!(session.quota_blocks("1"));
        assert_eq!(
            session.reveal(Some("1"), 2, t(2)).unwrap_err(),
            SessionError::TableLimitReached
        );
        session.counters.table_number = MAX_CYCLE;
        assert!(session.quota_blocks("1"));
    }

    #[test]
    fn check_table_status_never_lifts_the_quota() {
        let mut session = seated(&["1"]);
        session.counters.table_number = MAX_CYCLE;
        session
            .counters
            .tables_played
            .insert("1".into(), MAX_TABLES_PER_DAY + 1);
        assert_eq!(
            session.reveal(Some("1"), 0, t(1)).unwrap_err(),
            SessionError::TableLimitReached
        );

        let out = session.check_table_status("1").unwrap();
        assert!(!out.save);
        assert!(out.differential.is_empty());
        assert_eq!(session.tables_played("1"), MAX_TABLES_PER_DAY + 1);
        assert!(session.quota_blocks("1"));
        assert_eq!(
            session.reveal(Some("1"), 0, t(2)).unwrap_err(),
            SessionError::TableLimitReached
        );
        assert!(out.messages.iter().any(|d| matches!(
            &d.message,
            ServerMessage::TablesUpdate(status) if status.max_reached
        )));
    }

    #[test]
    fn check_table_status_reports_the_final_cycle_carve_out() {
        let mut session = seated(&["1"]);
        session.counters.table_number = MAX_CYCLE;
        session
            .counters
            .tables_played
            .insert("1".into(), MAX_TABLES_PER_DAY);
        let out = session.check_table_status("1").unwrap();
        assert_eq!(session.tables_played("1"), MAX_TABLES_PER_DAY);
        assert!(out.messages.iter().any(|d| matches!(
            &d.message,
            ServerMessage::TablesUpdate(status) if !status.max_reached
        )));

        session.counters.table_number = MAX_CYCLE - 1;
        let out = session.check_table_status("1").unwrap();
        assert!(out.messages.iter().any(|d| matches!(
            &d.message,
            ServerMessage::TablesUpdate(status) if status.max_reached
        )));
    }

    #[test]
    fn revealing_the_whole_board_starts_next_cycle() {
        let mut session = seated(&["1", "2", "3"]);
        for _ in 0..MAX_SELECTIONS {
            session.selections.record_selection("3");
        }
        session.selections.record_selection("2");
        session.selections.record_selection("2");
        session.counters.tables_played.insert("1".into(), 4);
        session.counters.table_number = 3;

        // Leave exactly one hidden tile for the current player.
        let last = 15;
        for index in 0..last {
            session.board.reveal(index, "x", t(0));
        }
        let out = session.reveal(Some("1"), last, t(1)).unwrap();

        assert_eq!(session.counters.table_number, 4);
        assert_eq!(session.tables_played("1"), 5);
        assert_eq!(session.tables_played("2"), 1);
        assert_eq!(session.tables_played("3"), 0);
        assert_eq!(session.board.revealed_count(), 0);
        assert!(session.board.is_balanced());
        assert_eq!(session.selections.count("1"), 0);
        assert_eq!(session.selections.count("2"), 0);
        assert_eq!(session.selections.count("3"), MAX_SELECTIONS);
        assert!(session.selections.is_latched("3"));
        assert!(out.messages.iter().any(|d| matches!(
            d.message,
            ServerMessage::TableCycleAdvanced { table_number: 4, .. }
        )));
        assert_eq!(out.turn.unwrap().action, TurnAction::Advance);
    }

    #[test]
    fn cycle_counter_wraps_after_max() {
        let mut session = seated(&["1"]);
        session.counters.table_number = MAX_CYCLE;
        let mut out = Outcome::default();
        session.board_only_reset(t(1), &mut out);
        assert_eq!(session.counters.table_number, 1);
    }

    #[test]
    fn board_reset_recomputes_connection_flags() {
        let mut session = seated(&["1", "2"]);
        session.slots[1].connection = None;
        let mut out = Outcome::default();
        assert!(session.board_only_reset(t(1), &mut out));
        assert!(!session.slots[1].is_connected);
        assert_eq!(session.current_account().map(String::as_str), Some("1"));
    }

    #[test]
    fn full_reset_restores_everything_and_orders_broadcasts() {
        let mut session = seated(&["1", "2"]);
        session.ledger.set_absolute("1", 10_000).unwrap();
        session.ledger.toggle_manual_block("2");
        session.counters.table_number = 6;
        session.counters.tables_played.insert("1".into(), 3);
        for _ in 0..MAX_SELECTIONS {
            session.selections.record_selection("2");
        }

        let out = session.admin_reset_game("admin", t(3)).unwrap();
        assert_eq!(session.status(), SessionStatus::Resetting);
        assert_eq!(session.counters.table_number, 1);
        assert_eq!(session.tables_played("1"), 0);
        assert!(!session.selections.is_latched("2"));
        for id in ["1", "2", "3"] {
            let account = session.ledger.get(id).unwrap();
            assert_eq!(account.score, STARTING_SCORE);
            assert!(!account.is_manually_blocked);
            assert!(!account.is_score_locked);
        }

        let kinds: Vec<&str> = out
            .messages
            .iter()
            .filter(|d| d.audience == Audience::Everyone)
            .map(|d| match &d.message {
                ServerMessage::ConnectionStatus { .. } => "connection",
                ServerMessage::GameState(view)
                    if view.reason == Some(SnapshotReason::ResetCompleted) =>
                {
                    "snapshot"
                }
                ServerMessage::GameReset => "reset",
                ServerMessage::Notice { .. } => "notice",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, ["connection", "snapshot", "reset", "notice"]);

        let command = out.turn.unwrap();
        assert_eq!(command.action, TurnAction::Resume);
        assert_eq!(command.delay, RESET_RESUME_DELAY);
        assert_eq!(
            session.reveal(Some("1"), 0, t(4)).unwrap_err(),
            SessionError::TurnExpired
        );

        fire(&mut session, &out, t(5));
        assert_eq!(session.status(), SessionStatus::Playing);
        assert_eq!(session.current_account().map(String::as_str), Some("1"));
    }

    #[test]
    fn full_reset_requires_admin() {
        let mut session = seated(&["1"]);
        assert_eq!(
            session.admin_reset_game("1", t(1)).unwrap_err(),
            SessionError::Unauthorized
        );
    }

    #[test]
    fn leaving_current_player_advances_after_delay() {
        let mut session = seated(&["1", "2"]);
        let out = session.leave("1", t(1));
        let command = out.turn.unwrap();
        assert_eq!(command.action, TurnAction::Advance);
        assert_eq!(command.delay, ADVANCE_AFTER_LEAVE);
        assert!(!session.slots[0].is_connected);
        assert!(session.resumable().contains_key("1"));

        fire(&mut session, &out, t(2));
        assert_eq!(session.current_account().map(String::as_str), Some("2"));
    }

    #[test]
    fn superseded_turn_task_is_ignored() {
        let mut session = seated(&["1", "2"]);
        let stale = session.turn_epoch();
        session.reveal(Some("1"), 0, t(1)).unwrap();
        assert!(session.run_turn_task(stale, TurnAction::Expire, t(7)).is_none());
        assert_eq!(session.current_account().map(String::as_str), Some("1"));
    }

    #[test]
    fn timeout_broadcasts_then_advances_after_grace() {
        let mut session = seated(&["1", "2"]);
        let epoch = session.turn_epoch();
        let out = session.run_turn_task(epoch, TurnAction::Expire, t(6)).unwrap();
        assert!(matches!(
            &out.messages[0].message,
            ServerMessage::TurnTimeout { account_id, .. } if account_id == "1"
        ));
        assert_eq!(out.turn.unwrap().delay, TIMEOUT_GRACE);
        fire(&mut session, &out, t(7));
        assert_eq!(session.current_account().map(String::as_str), Some("2"));
    }

    #[test]
    fn disconnect_only_affects_owning_connection() {
        let mut session = GameSession::new(ledger());
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        session.join("1", Some(old), t(0)).unwrap();
        session.join("1", Some(new), t(1)).unwrap();
        let out = session.disconnect(old, t(2));
        assert!(out.messages.is_empty());
        assert!(session.slots[0].is_connected);
        session.disconnect(new, t(3));
        assert!(!session.slots[0].is_connected);
    }

    #[test]
    fn rebound_seat_survives_the_old_connection_closing() {
        let mut session = GameSession::new(ledger());
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        session.join("1", Some(old), t(0)).unwrap();
        assert!(session.rebind_connection("1", new));
        assert!(!session.rebind_connection("2", new));
        session.disconnect(old, t(1));
        assert!(session.slots[0].is_connected);
        assert_eq!(session.slots[0].connection, Some(new));
    }

    #[test]
    fn admin_block_of_current_player_rotates() {
        let mut session = seated(&["1", "2"]);
        let out = session.admin_toggle_block("admin", "1", t(1)).unwrap();
        let command = out.turn.unwrap();
        assert_eq!(command.delay, ADVANCE_AFTER_REVEAL);
        fire(&mut session, &out, t(2));
        assert_eq!(session.current_account().map(String::as_str), Some("2"));
        assert_eq!(
            session.admin_toggle_block("1", "2", t(3)).unwrap_err(),
            SessionError::Unauthorized
        );
    }

    #[test]
    fn admin_score_edits_keep_lock_invariant() {
        let mut session = seated(&["1"]);
        session.admin_set_score("admin", "1", 20_000, t(1)).unwrap();
        assert!(session.ledger.get("1").unwrap().is_score_locked);
        session.admin_update_score("admin", "1", 4_000, t(2)).unwrap();
        assert!(!session.ledger.get("1").unwrap().is_score_locked);
        assert_eq!(
            session
                .admin_update_score("admin", "nobody", 1, t(3))
                .unwrap_err(),
            SessionError::UnknownAccount("nobody".into())
        );
    }

    #[test]
    fn score_overflow_is_rejected_without_side_effects() {
        let mut session = seated(&["1"]);
        assert_eq!(
            session
                .admin_set_score("admin", "1", i64::MAX, t(1))
                .unwrap_err(),
            SessionError::Ledger(LedgerError::ScoreOutOfRange)
        );
        session.admin_set_score("admin", "1", MAX_SCORE, t(1)).unwrap();
        assert_eq!(
            session
                .admin_update_score("admin", "1", 1, t(2))
                .unwrap_err(),
            SessionError::Ledger(LedgerError::ScoreOutOfRange)
        );

        assert_eq!(
            session.reveal(Some("1"), 0, t(3)).unwrap_err(),
            SessionError::Ledger(LedgerError::ScoreOutOfRange)
        );
        assert!(!session.board.tile(0).unwrap().revealed);
        assert_eq!(session.selections.count("1"), 0);
        assert_eq!(session.ledger.get("1").unwrap().score, MAX_SCORE);
    }

    #[test]
    fn rename_updates_seat_and_rejects_collisions() {
        let mut session = seated(&["1"]);
        session.admin_rename("admin", "1", "Garza").unwrap();
        assert_eq!(session.slots[0].display_name, "Garza");
        assert_eq!(
            session.admin_rename("admin", "1", "tucan").unwrap_err(),
            SessionError::Ledger(LedgerError::NameTaken("tucan".into()))
        );
    }

    #[test]
    fn sync_prefers_resumable_board() {
        let mut session = seated(&["1", "2"]);
        session.leave("2", t(1));
        session.reveal(Some("1"), 0, t(2)).unwrap();
        let out = session.sync("2").unwrap();
        let ServerMessage::GameState(view) = &out.messages[0].message else {
            panic!("expected snapshot first");
        };
        assert!(view.board.iter().all(|tile| !tile.revealed));
        assert_eq!(view.reason, Some(SnapshotReason::Resync));
    }

    #[test]
    fn stale_resumable_states_are_dropped() {
        let mut session = seated(&["1"]);
        session.leave("1", t(0));
        assert!(!session.cleanup_resumable(t(60)).save);
        let out = session.cleanup_resumable(t(0) + RESUMABLE_STATE_TTL + Duration::from_secs(1));
        assert!(out.save);
        assert!(session.resumable().is_empty());
    }

    #[test]
    fn document_round_trip_restores_disconnected_seats() {
        let mut session = seated(&["1", "2"]);
        session.reveal(Some("1"), 0, t(1)).unwrap();
        let document = session.to_document(t(2));
        let restored = GameSession::restore(ledger(), document.clone());
        assert_eq!(restored.board, session.board);
        assert_eq!(restored.ledger.get("1"), session.ledger.get("1"));
        assert_eq!(restored.selections, session.selections);
        assert!(restored.slots().iter().all(|slot| !slot.is_connected));
        assert_eq!(restored.current_account(), None);
    }
}
