//! Account roster with scores, block flags and the automatic score lock.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Identifier of an account in the fixed roster.
pub type AccountId = String;

/// Score every player account starts with and returns to on a full reset.
pub const STARTING_SCORE: i64 = 60_000;
/// Accounts at or below this score are locked out of play.
pub const LOCK_THRESHOLD: i64 = 23_000;
/// Points granted by an admin recharge.
pub const RECHARGE_AMOUNT: i64 = 6_000;
/// Minimum length of an account credential.
pub const MIN_CREDENTIAL_LEN: usize = 6;
/// Highest score the ledger stores.
pub const MAX_SCORE: i64 = 1_000_000_000_000;
/// Lowest score the ledger stores.
pub const MIN_SCORE: i64 = -MAX_SCORE;

/// A roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Stable identifier.
    pub id: AccountId,
    /// Name shown to other participants and used to log in.
    pub display_name: String,
    /// Login secret.
    pub credential: String,
    /// Current score.
    pub score: i64,
    /// Score before the last mutation.
    pub previous_score: i64,
    /// Admin accounts never play and are never locked.
    pub is_privileged: bool,
    /// Block set by an admin.
    pub is_manually_blocked: bool,
    /// Automatic block derived from the score.
    pub is_score_locked: bool,
}

impl Account {
    /// Build a fresh account at the starting score.
    pub fn new(
        id: impl Into<AccountId>,
        display_name: impl Into<String>,
        credential: impl Into<String>,
        is_privileged: bool,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            credential: credential.into(),
            score: STARTING_SCORE,
            previous_score: STARTING_SCORE,
            is_privileged,
            is_manually_blocked: false,
            is_score_locked: false,
        }
    }

    /// Lock state implied by the current score.
    pub fn should_be_locked(&self) -> bool {
        !self.is_privileged && self.score <= LOCK_THRESHOLD
    }

    /// True when the account may take turns, ignoring seat and selection state.
    pub fn can_play(&self) -> bool {
        !self.is_privileged && !self.is_manually_blocked && !self.is_score_locked
    }

    fn reconcile_lock(&mut self) -> Option<LockChange> {
        let locked = self.should_be_locked();
        if locked == self.is_score_locked {
            return None;
        }
        self.is_score_locked = locked;
        Some(if locked {
            LockChange::Locked
        } else {
            LockChange::Unlocked
        })
    }
}

/// Direction of a score-lock flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockChange {
    /// The account fell to or below the threshold.
    Locked,
    /// The account rose above the threshold.
    Unlocked,
}

/// Result of a score mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreChange {
    /// Account that changed.
    pub account_id: AccountId,
    /// Score before the mutation.
    pub previous_score: i64,
    /// Score after the mutation.
    pub score: i64,
    /// Set when the mutation flipped the score lock.
    pub lock_change: Option<LockChange>,
}

/// Failures of roster edits.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// No account with this id.
    #[error("account `{0}` not found")]
    UnknownAccount(AccountId),
    /// Another account already uses the name, ignoring case.
    #[error("display name `{0}` is already taken")]
    NameTaken(String),
    /// Empty display name.
    #[error("display name cannot be empty")]
    EmptyName,
    /// Credential below the minimum length.
    #[error("credential must have at least {MIN_CREDENTIAL_LEN} characters")]
    CredentialTooShort,
    /// The resulting score would leave `[MIN_SCORE, MAX_SCORE]`.
    #[error("score must stay within ±{MAX_SCORE}")]
    ScoreOutOfRange,
}

fn bounded(score: Option<i64>) -> Result<i64, LedgerError> {
    score
        .filter(|score| (MIN_SCORE..=MAX_SCORE).contains(score))
        .ok_or(LedgerError::ScoreOutOfRange)
}

/// Owns every account of the roster, in roster order.
#[derive(Debug, Clone, Default)]
pub struct ScoreLedger {
    accounts: IndexMap<AccountId, Account>,
}

impl ScoreLedger {
    /// Build the ledger, reconciling every lock flag with its score.
    pub fn new(accounts: impl IntoIterator<Item = Account>) -> Self {
        let accounts = accounts
            .into_iter()
            .map(|mut account| {
                account.reconcile_lock();
                (account.id.clone(), account)
            })
            .collect();
        Self { accounts }
    }

    /// Look up an account.
    pub fn get(&self, id: &str) -> Option<&Account> {
        self.accounts.get(id)
    }

    /// Iterate accounts in roster order.
    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// Number of accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// True when the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Find the account matching both display name and credential.
    pub fn authenticate(&self, display_name: &str, credential: &str) -> Option<&Account> {
        self.accounts
            .values()
            .find(|account| account.display_name == display_name && account.credential == credential)
    }

    /// Score `id` would have after adding `delta`, without applying it.
    pub fn check_delta(&self, id: &str, delta: i64) -> Result<i64, LedgerError> {
        let account = self
            .accounts
            .get(id)
            .ok_or_else(|| LedgerError::UnknownAccount(id.to_string()))?;
        bounded(account.score.checked_add(delta))
    }

    /// Add `delta` to the score and re-evaluate the lock.
    pub fn apply_delta(&mut self, id: &str, delta: i64) -> Result<ScoreChange, LedgerError> {
        let score = self.check_delta(id, delta).inspect_err(|err| {
            warn!(account_id = %id, delta, error = %err, "score delta rejected");
        })?;
        let account = self.account_mut(id)?;
        let previous_score = account.score;
        account.previous_score = previous_score;
        account.score = score;
        Ok(Self::finish_change(account, previous_score))
    }

    /// Overwrite the score and re-evaluate the lock.
    pub fn set_absolute(&mut self, id: &str, value: i64) -> Result<ScoreChange, LedgerError> {
        let score = bounded(Some(value))?;
        let account = self.account_mut(id).inspect_err(|_| {
            warn!(account_id = %id, value, "score override for unknown account ignored");
        })?;
        let previous_score = account.score;
        account.previous_score = previous_score;
        account.score = score;
        Ok(Self::finish_change(account, previous_score))
    }

    /// Grant the recharge amount and lift any manual block.
    pub fn recharge(&mut self, id: &str) -> Result<ScoreChange, LedgerError> {
        let score = self.check_delta(id, RECHARGE_AMOUNT)?;
        let account = self.account_mut(id)?;
        let previous_score = account.score;
        account.score = score;
        account.previous_score = score;
        account.is_manually_blocked = false;
        Ok(Self::finish_change(account, previous_score))
    }

    fn account_mut(&mut self, id: &str) -> Result<&mut Account, LedgerError> {
        self.accounts
            .get_mut(id)
            .ok_or_else(|| LedgerError::UnknownAccount(id.to_string()))
    }

    fn finish_change(account: &mut Account, previous_score: i64) -> ScoreChange {
        let lock_change = account.reconcile_lock();
        if let Some(change) = lock_change {
            info!(
                account_id = %account.id,
                score = account.score,
                change = ?change,
                "score lock changed"
            );
        }
        ScoreChange {
            account_id: account.id.clone(),
            previous_score,
            score: account.score,
            lock_change,
        }
    }

    /// Flip the manual block, returning the new value.
    pub fn toggle_manual_block(&mut self, id: &str) -> Option<bool> {
        let account = self.accounts.get_mut(id)?;
        account.is_manually_blocked = !account.is_manually_blocked;
        Some(account.is_manually_blocked)
    }

    /// Force the score-lock flag. Returns the previous value.
    ///
    /// This is an admin override: the next score mutation or audit
    /// re-derives the flag from the score.
    pub fn set_score_lock(&mut self, id: &str, locked: bool) -> Option<bool> {
        let account = self.accounts.get_mut(id)?;
        let previous = account.is_score_locked;
        account.is_score_locked = locked;
        Some(previous)
    }

    /// Re-derive the lock flag from the score.
    pub fn reconcile_lock(&mut self, id: &str) -> Option<LockChange> {
        self.accounts.get_mut(id)?.reconcile_lock()
    }

    /// Rename an account; names are unique ignoring case.
    pub fn rename(&mut self, id: &str, new_name: &str) -> Result<(), LedgerError> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(LedgerError::EmptyName);
        }
        let lowered = new_name.to_lowercase();
        let taken = self
            .accounts
            .values()
            .any(|account| account.id != id && account.display_name.to_lowercase() == lowered);
        if taken {
            return Err(LedgerError::NameTaken(new_name.to_string()));
        }
        let account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| LedgerError::UnknownAccount(id.to_string()))?;
        account.display_name = new_name.to_string();
        Ok(())
    }

    /// Replace an account credential.
    pub fn change_credential(&mut self, id: &str, secret: &str) -> Result<(), LedgerError> {
        if secret.chars().count() < MIN_CREDENTIAL_LEN {
            return Err(LedgerError::CredentialTooShort);
        }
        let account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| LedgerError::UnknownAccount(id.to_string()))?;
        account.credential = secret.to_string();
        Ok(())
    }

    /// Restore every player to the starting score and clear all blocks.
    pub fn restore_all(&mut self) {
        for account in self.accounts.values_mut().filter(|a| !a.is_privileged) {
            account.score = STARTING_SCORE;
            account.previous_score = STARTING_SCORE;
            account.is_manually_blocked = false;
            account.is_score_locked = false;
            account.reconcile_lock();
        }
    }

    /// Replace mutable fields of known accounts with persisted values.
    ///
    /// Persisted accounts missing from the roster are ignored.
    pub fn restore_from(&mut self, persisted: impl IntoIterator<Item = Account>) {
        for saved in persisted {
            let Some(account) = self.accounts.get_mut(&saved.id) else {
                warn!(account_id = %saved.id, "ignoring persisted account missing from roster");
                continue;
            };
            account.display_name = saved.display_name;
            account.credential = saved.credential;
            account.score = saved.score;
            account.previous_score = saved.previous_score;
            account.is_manually_blocked = saved.is_manually_blocked;
            account.is_score_locked = saved.is_score_locked && !account.is_privileged;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> ScoreLedger {
        ScoreLedger::new([
            Account::new("1", "Condor", "vuela741", false),
            Account::new("2", "Tucan", "colores963", false),
            Account::new("admin", "admin", "admin1998", true),
        ])
    }

    #[test]
    fn apply_delta_tracks_previous_score() {
        let mut ledger = ledger();
        let change = ledger.apply_delta("1", 15_000).unwrap();
        assert_eq!(change.previous_score, STARTING_SCORE);
        assert_eq!(change.score, 75_000);
        assert_eq!(change.lock_change, None);
        assert_eq!(ledger.get("1").unwrap().previous_score, STARTING_SCORE);
    }

    #[test]
    fn falling_to_threshold_locks_exactly_once() {
        let mut ledger = ledger();
        ledger.set_absolute("1", 25_000).unwrap();
        let change = ledger.apply_delta("1", -16_000).unwrap();
        assert_eq!(change.score, 9_000);
        assert_eq!(change.lock_change, Some(LockChange::Locked));
        assert!(ledger.get("1").unwrap().is_score_locked);

        let again = ledger.apply_delta("1", -16_000).unwrap();
        assert_eq!(again.lock_change, None);
    }

    #[test]
    fn lock_boundary_is_inclusive() {
        let mut ledger = ledger();
        let change = ledger.set_absolute("1", LOCK_THRESHOLD).unwrap();
        assert_eq!(change.lock_change, Some(LockChange::Locked));
        let change = ledger.set_absolute("1", LOCK_THRESHOLD + 1).unwrap();
        assert_eq!(change.lock_change, Some(LockChange::Unlocked));
        assert!(!ledger.get("1").unwrap().is_score_locked);
    }

    #[test]
    fn privileged_accounts_never_lock() {
        let mut ledger = ledger();
        let change = ledger.set_absolute("admin", 0).unwrap();
        assert_eq!(change.lock_change, None);
        assert!(!ledger.get("admin").unwrap().is_score_locked);
    }

    #[test]
    fn unknown_account_is_rejected() {
        let mut ledger = ledger();
        let missing = LedgerError::UnknownAccount("missing".into());
        assert_eq!(ledger.apply_delta("missing", 10), Err(missing.clone()));
        assert_eq!(ledger.set_absolute("missing", 10), Err(missing));
    }

    #[test]
    fn score_arithmetic_never_overflows() {
        let mut ledger = ledger();
        assert_eq!(
            ledger.set_absolute("1", i64::MAX),
            Err(LedgerError::ScoreOutOfRange)
        );
        ledger.set_absolute("1", MAX_SCORE).unwrap();
        assert_eq!(ledger.apply_delta("1", 1), Err(LedgerError::ScoreOutOfRange));
        assert_eq!(ledger.recharge("1"), Err(LedgerError::ScoreOutOfRange));
        assert_eq!(
            ledger.apply_delta("1", i64::MIN),
            Err(LedgerError::ScoreOutOfRange)
        );
        let account = ledger.get("1").unwrap();
        assert_eq!(account.score, MAX_SCORE);
        assert!(!account.is_manually_blocked);
    }

    #[test]
    fn lock_invariant_holds_after_mutations() {
        let mut ledger = ledger();
        for delta in [-16_000, -16_000, 15_000, -16_000, 15_000, 15_000, 15_000] {
            ledger.apply_delta("2", delta).unwrap();
            let account = ledger.get("2").unwrap();
            assert_eq!(account.is_score_locked, account.score <= LOCK_THRESHOLD);
        }
        ledger.restore_all();
        assert!(ledger.iter().all(|a| a.is_score_locked == a.should_be_locked()));
    }

    #[test]
    fn recharge_clears_block_and_unlocks() {
        let mut ledger = ledger();
        ledger.set_absolute("1", 20_000).unwrap();
        ledger.toggle_manual_block("1");
        let change = ledger.recharge("1").unwrap();
        assert_eq!(change.score, 26_000);
        assert_eq!(change.lock_change, Some(LockChange::Unlocked));
        let account = ledger.get("1").unwrap();
        assert!(!account.is_manually_blocked);
        assert_eq!(account.previous_score, 26_000);
    }

    #[test]
    fn rename_rejects_case_insensitive_collision() {
        let mut ledger = ledger();
        assert_eq!(
            ledger.rename("1", "tucan"),
            Err(LedgerError::NameTaken("tucan".into()))
        );
        assert_eq!(ledger.rename("1", "condor"), Ok(()));
        assert_eq!(ledger.get("1").unwrap().display_name, "condor");
        assert_eq!(ledger.rename("1", "  "), Err(LedgerError::EmptyName));
    }

    #[test]
    fn credential_needs_six_characters() {
        let mut ledger = ledger();
        assert_eq!(
            ledger.change_credential("1", "abc12"),
            Err(LedgerError::CredentialTooShort)
        );
        ledger.change_credential("1", "abc123").unwrap();
        assert!(ledger.authenticate("Condor", "abc123").is_some());
        assert!(ledger.authenticate("Condor", "vuela741").is_none());
    }

    #[test]
    fn manual_lock_override_is_reconciled() {
        let mut ledger = ledger();
        ledger.set_absolute("1", 10_000).unwrap();
        assert_eq!(ledger.set_score_lock("1", false), Some(true));
        assert_eq!(ledger.reconcile_lock("1"), Some(LockChange::Locked));
    }
}
