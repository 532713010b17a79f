//! Turn rotation over the seated players.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::ledger::AccountId;

/// Time a player has to reveal a tile.
pub const TURN_DURATION: Duration = Duration::from_secs(6);
/// Pause between a timeout notice and the next rotation.
pub const TIMEOUT_GRACE: Duration = Duration::from_millis(500);
/// Delay before retrying when nobody can play.
pub const NO_ELIGIBLE_RETRY: Duration = Duration::from_secs(5);
/// Delay before rotating after a reveal or an admin block.
pub const ADVANCE_AFTER_REVEAL: Duration = Duration::from_millis(500);
/// Delay before rotating after the current player left.
pub const ADVANCE_AFTER_LEAVE: Duration = Duration::from_secs(1);

/// Identifier of one live transport connection.
pub type ConnectionId = Uuid;

/// A seated account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSlot {
    /// Seated account.
    pub account_id: AccountId,
    /// Name at the time of seating, refreshed on rename.
    pub display_name: String,
    /// Live connection owning the seat.
    #[serde(skip)]
    pub connection: Option<ConnectionId>,
    /// Whether the account currently has a live connection.
    pub is_connected: bool,
}

impl PlayerSlot {
    /// Seat a connected account.
    pub fn connected(
        account_id: impl Into<AccountId>,
        display_name: impl Into<String>,
        connection: Option<ConnectionId>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            display_name: display_name.into(),
            connection,
            is_connected: true,
        }
    }
}

/// What [`TurnScheduler::advance`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDecision {
    /// The slot at this index now holds the turn.
    Selected(usize),
    /// Nobody is eligible; the turn is unset.
    NoneEligible,
    /// A full scan found nobody; the previous index is kept.
    Retry,
}

/// Current-player bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnScheduler {
    current: Option<usize>,
    cursor: usize,
    turn_started_at: Option<SystemTime>,
}

impl TurnScheduler {
    /// Restore persisted turn fields.
    pub fn restore(
        current: Option<usize>,
        cursor: usize,
        turn_started_at: Option<SystemTime>,
    ) -> Self {
        Self {
            current,
            cursor,
            turn_started_at,
        }
    }

    /// Index of the slot holding the turn.
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Last index that held the turn; the rotation resumes after it.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// When the current turn started.
    pub fn turn_started_at(&self) -> Option<SystemTime> {
        self.turn_started_at
    }

    /// Account holding the turn.
    pub fn current_account<'a>(&self, slots: &'a [PlayerSlot]) -> Option<&'a AccountId> {
        self.current
            .and_then(|index| slots.get(index))
            .map(|slot| &slot.account_id)
    }

    /// True when `account` holds the turn.
    pub fn is_current(&self, slots: &[PlayerSlot], account: &str) -> bool {
        self.current_account(slots)
            .is_some_and(|current| current == account)
    }

    /// True when no turn is running or the running one is out of time.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self.turn_started_at {
            Some(start) => now
                .duration_since(start)
                .is_ok_and(|elapsed| elapsed >= TURN_DURATION),
            None => true,
        }
    }

    /// Give the turn to `index` directly.
    pub fn select(&mut self, index: usize, now: SystemTime) {
        self.current = Some(index);
        self.cursor = index;
        self.turn_started_at = Some(now);
    }

    /// Hand the turn to `index` without starting its clock.
    pub fn assign(&mut self, index: usize) {
        self.current = Some(index);
        self.cursor = index;
        self.turn_started_at = None;
    }

    /// Drop the current turn.
    pub fn clear(&mut self) {
        self.current = None;
        self.turn_started_at = None;
    }

    /// Forget everything, used when the seats are rebuilt.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Rotate to the next eligible slot.
    ///
    /// A single eligible slot always wins. Otherwise the scan starts right
    /// after the last turn holder and wraps once around the table.
    pub fn advance<F>(&mut self, slots: &[PlayerSlot], now: SystemTime, is_eligible: F) -> TurnDecision
    where
        F: Fn(&PlayerSlot) -> bool,
    {
        let eligible: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| is_eligible(slot))
            .map(|(index, _)| index)
            .collect();

        match eligible.as_slice() {
            [] => {
                self.clear();
                TurnDecision::NoneEligible
            }
            [only] => {
                self.select(*only, now);
                TurnDecision::Selected(*only)
            }
            _ => {
                let n = slots.len();
                let start = (self.cursor + 1) % n;
                let found = (0..n)
                    .map(|step| (start + step) % n)
                    .find(|index| is_eligible(&slots[*index]));
                match found {
                    Some(index) => {
                        self.select(index, now);
                        TurnDecision::Selected(index)
                    }
                    None => TurnDecision::Retry,
                }
            }
        }
    }

    /// Shift indices after seats were removed or reordered.
    pub fn clamp_to(&mut self, seats: usize) {
        if self.current.is_some_and(|index| index >= seats) {
            self.clear();
        }
        if seats == 0 || self.cursor >= seats {
            self.cursor = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(n: usize) -> Vec<PlayerSlot> {
        (0..n)
            .map(|i| PlayerSlot::connected(i.to_string(), format!("p{i}"), None))
            .collect()
    }

    #[test]
    fn single_eligible_slot_wins_regardless_of_index() {
        let seats = slots(4);
        for cursor in 0..4 {
            let mut scheduler = TurnScheduler::restore(Some(cursor), cursor, None);
            let decision = scheduler.advance(&seats, SystemTime::now(), |s| s.account_id == "2");
            assert_eq!(decision, TurnDecision::Selected(2));
            assert_eq!(scheduler.current(), Some(2));
        }
    }

    #[test]
    fn rotation_wraps_and_skips_ineligible() {
        let seats = slots(4);
        let mut scheduler = TurnScheduler::restore(Some(0), 0, None);
        let eligible = |s: &PlayerSlot| s.account_id != "1";
        let now = SystemTime::now();
        assert_eq!(scheduler.advance(&seats, now, eligible), TurnDecision::Selected(2));
        assert_eq!(scheduler.advance(&seats, now, eligible), TurnDecision::Selected(3));
        assert_eq!(scheduler.advance(&seats, now, eligible), TurnDecision::Selected(0));
        assert_eq!(scheduler.turn_started_at(), Some(now));
    }

    #[test]
    fn nobody_eligible_unsets_turn_but_keeps_cursor() {
        let seats = slots(3);
        let mut scheduler = TurnScheduler::restore(Some(1), 1, Some(SystemTime::now()));
        assert_eq!(
            scheduler.advance(&seats, SystemTime::now(), |_| false),
            TurnDecision::NoneEligible
        );
        assert_eq!(scheduler.current(), None);
        assert_eq!(scheduler.cursor(), 1);
        assert!(scheduler.is_expired(SystemTime::now()));
    }

    #[test]
    fn expiry_uses_turn_duration() {
        let start = SystemTime::now();
        let mut scheduler = TurnScheduler::default();
        scheduler.select(0, start);
        assert!(!scheduler.is_expired(start + Duration::from_millis(5_999)));
        assert!(scheduler.is_expired(start + TURN_DURATION));
    }

    #[test]
    fn current_account_follows_index() {
        let seats = slots(2);
        let mut scheduler = TurnScheduler::default();
        assert_eq!(scheduler.current_account(&seats), None);
        scheduler.select(1, SystemTime::now());
        assert!(scheduler.is_current(&seats, "1"));
        scheduler.clamp_to(1);
        assert_eq!(scheduler.current(), None);
    }
}
