//! Per-account reveal counters and the permanent completion latch.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::state::ledger::AccountId;

/// Reveals allowed per account before its selections latch.
pub const MAX_SELECTIONS: u32 = 5;

/// Reveal progress of one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRecord {
    /// Tiles revealed since the last board regeneration.
    pub revealed_this_cycle: u32,
    /// One-way latch, cleared only by a full reset.
    pub permanently_completed: bool,
    /// Client-facing completion notice flag.
    #[serde(default)]
    pub show_completion_notice: bool,
}

/// Outcome of recording a reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recorded {
    /// Count after the increment.
    pub count: u32,
    /// True when this reveal set the latch.
    pub just_latched: bool,
}

/// Selection records keyed by account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionTracker {
    records: IndexMap<AccountId, SelectionRecord>,
}

impl SelectionTracker {
    /// Rebuild from persisted records.
    pub fn from_records(records: IndexMap<AccountId, SelectionRecord>) -> Self {
        Self { records }
    }

    /// Borrow every record.
    pub fn records(&self) -> &IndexMap<AccountId, SelectionRecord> {
        &self.records
    }

    /// Lazily create a zeroed record.
    pub fn ensure(&mut self, id: &str) -> &mut SelectionRecord {
        self.records.entry(id.to_string()).or_default()
    }

    /// Borrow a record if one exists.
    pub fn get(&self, id: &str) -> Option<&SelectionRecord> {
        self.records.get(id)
    }

    /// Reveals recorded for the account this cycle.
    pub fn count(&self, id: &str) -> u32 {
        self.records.get(id).map_or(0, |r| r.revealed_this_cycle)
    }

    /// True once the account latched.
    pub fn is_latched(&self, id: &str) -> bool {
        self.records.get(id).is_some_and(|r| r.permanently_completed)
    }

    /// Increment the count, latching at [`MAX_SELECTIONS`].
    ///
    /// Callers check the latch and the limit first; a latched record is left
    /// untouched.
    pub fn record_selection(&mut self, id: &str) -> Recorded {
        let record = self.ensure(id);
        if record.permanently_completed {
            return Recorded {
                count: record.revealed_this_cycle,
                just_latched: false,
            };
        }
        record.revealed_this_cycle = (record.revealed_this_cycle + 1).min(MAX_SELECTIONS);
        let just_latched = record.revealed_this_cycle >= MAX_SELECTIONS;
        if just_latched {
            record.permanently_completed = true;
            record.show_completion_notice = true;
        }
        Recorded {
            count: record.revealed_this_cycle,
            just_latched,
        }
    }

    /// Zero the cycle count unless the account latched. Returns whether it reset.
    pub fn reset_cycle(&mut self, id: &str) -> bool {
        let record = self.ensure(id);
        if record.permanently_completed {
            return false;
        }
        record.revealed_this_cycle = 0;
        record.show_completion_notice = false;
        true
    }

    /// Apply [`Self::reset_cycle`] to every record.
    pub fn reset_all_cycles(&mut self) {
        let ids: Vec<AccountId> = self.records.keys().cloned().collect();
        for id in ids {
            self.reset_cycle(&id);
        }
    }

    /// Drop every record, clearing all latches.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latches_at_exactly_max_selections() {
        let mut tracker = SelectionTracker::default();
        for expected in 1..MAX_SELECTIONS {
            let recorded = tracker.record_selection("1");
            assert_eq!(recorded.count, expected);
            assert!(!recorded.just_latched);
            assert!(!tracker.is_latched("1"));
        }
        let last = tracker.record_selection("1");
        assert_eq!(last.count, MAX_SELECTIONS);
        assert!(last.just_latched);
        assert!(tracker.is_latched("1"));

        let after = tracker.record_selection("1");
        assert_eq!(after.count, MAX_SELECTIONS);
        assert!(!after.just_latched);
    }

    #[test]
    fn reset_cycle_skips_latched_records() {
        let mut tracker = SelectionTracker::default();
        tracker.record_selection("1");
        tracker.record_selection("1");
        for _ in 0..MAX_SELECTIONS {
            tracker.record_selection("2");
        }

        tracker.reset_all_cycles();
        assert_eq!(tracker.count("1"), 0);
        assert_eq!(tracker.count("2"), MAX_SELECTIONS);
        assert!(!tracker.reset_cycle("2"));
        assert!(tracker.is_latched("2"));

        tracker.clear();
        assert!(!tracker.is_latched("2"));
        assert_eq!(tracker.count("2"), 0);
    }

    #[test]
    fn ensure_creates_zeroed_record() {
        let mut tracker = SelectionTracker::default();
        assert!(tracker.get("7").is_none());
        assert_eq!(tracker.ensure("7"), &SelectionRecord::default());
        assert_eq!(tracker.records().len(), 1);
    }
}
