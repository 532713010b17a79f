//! Periodic self-repair of the session invariants.

use std::time::SystemTime;

use tracing::{info, warn};

use crate::{
    dto::ws::ServerMessage,
    state::{
        board::Board,
        ledger::{AccountId, LockChange},
        session::{Audience, GameSession, MAX_CYCLE, Outcome},
    },
};

/// Corrections applied by one audit pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// The board failed its balance or shape check and was replaced.
    pub board_regenerated: bool,
    /// Accounts whose score lock disagreed with their score.
    pub locks_corrected: Vec<AccountId>,
    /// The cycle counter or turn cursor was out of range.
    pub cycle_clamped: bool,
}

impl AuditReport {
    /// Nothing needed fixing.
    pub fn is_clean(&self) -> bool {
        !self.board_regenerated && self.locks_corrected.is_empty() && !self.cycle_clamped
    }
}

impl GameSession {
    /// Check board balance, every score lock and the cycle counter.
    ///
    /// Idempotent: a second pass right after the first reports no correction.
    pub fn audit(&mut self, now: SystemTime) -> (AuditReport, Outcome) {
        let mut out = Outcome::default();
        let mut report = AuditReport::default();

        if !self.board.is_balanced() {
            warn!(
                tiles = self.board.len(),
                revealed = self.board.revealed_count(),
                "board failed the balance check; regenerating"
            );
            self.board = Board::generate();
            report.board_regenerated = true;
        }

        let clamped = self.counters.table_number.clamp(1, MAX_CYCLE);
        if clamped != self.counters.table_number {
            warn!(
                table_number = self.counters.table_number,
                clamped, "cycle counter out of range"
            );
            self.counters.table_number = clamped;
            report.cycle_clamped = true;
        }

        report.locks_corrected = self.reconcile_locks(now, &mut out);

        if report.board_regenerated || report.cycle_clamped {
            out.broadcast(self.snapshot());
        }
        if !report.is_clean() {
            info!(report = ?report, "integrity audit applied corrections");
            out.save = true;
        }
        (report, out)
    }

    /// Score-lock pass only, run more often than the full audit.
    pub fn audit_locks(&mut self, now: SystemTime) -> (Vec<AccountId>, Outcome) {
        let mut out = Outcome::default();
        let corrected = self.reconcile_locks(now, &mut out);
        if !corrected.is_empty() {
            info!(accounts = ?corrected, "score locks corrected");
            out.save = true;
        }
        (corrected, out)
    }

    fn reconcile_locks(&mut self, now: SystemTime, out: &mut Outcome) -> Vec<AccountId> {
        let players: Vec<AccountId> = self
            .ledger
            .iter()
            .filter(|account| !account.is_privileged)
            .map(|account| account.id.clone())
            .collect();

        let mut corrected = Vec::new();
        for id in players {
            let Some(change) = self.ledger.reconcile_lock(&id) else {
                continue;
            };
            let Some(account) = self.ledger.get(&id) else {
                continue;
            };
            warn!(account_id = %id, score = account.score, change = ?change, "score lock mismatch");
            let notice = match change {
                LockChange::Locked => ServerMessage::ScoreLocked {
                    account_id: id.clone(),
                    score: account.score,
                },
                LockChange::Unlocked => ServerMessage::ScoreUnlocked {
                    account_id: id.clone(),
                    score: account.score,
                },
            };
            let status = Self::block_status(account);
            out.write_now(
                format!("accounts/{id}/is_score_locked"),
                account.is_score_locked,
            );
            out.to(&id, notice);
            out.to(&id, status);
            corrected.push(id);
        }

        if !corrected.is_empty() {
            out.send(
                Audience::Admins,
                ServerMessage::Roster {
                    accounts: self.roster(),
                },
            );
            for id in &corrected {
                self.after_eligibility_change(id, now, out);
            }
        }
        corrected
    }
}
