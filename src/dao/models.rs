//! Persisted shape of the game session.

use std::time::SystemTime;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{TimestampMilliSeconds, serde_as};

use crate::state::{
    board::Board,
    ledger::{Account, AccountId},
    scheduler::PlayerSlot,
    selections::SelectionRecord,
    session::{ResumableState, SessionCounters, SessionStatus},
};

/// Version written into every snapshot.
pub const DOCUMENT_VERSION: u32 = 1;

/// Field-level changes keyed by slash-separated paths into a [`SessionDocument`],
/// e.g. `board/3` or `accounts/2/score`.
pub type FieldUpdates = IndexMap<String, Value>;

fn default_version() -> u32 {
    DOCUMENT_VERSION
}

/// Complete persisted game state.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    pub board: Board,
    #[serde(default)]
    pub players: Vec<PlayerSlot>,
    #[serde(default)]
    pub selections: IndexMap<AccountId, SelectionRecord>,
    #[serde(default)]
    pub counters: SessionCounters,
    #[serde(default)]
    pub current_player_index: Option<usize>,
    #[serde(default)]
    pub rotation_cursor: usize,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub turn_started_at: Option<SystemTime>,
    #[serde(default)]
    pub accounts: IndexMap<AccountId, Account>,
    #[serde(default)]
    pub resumable: IndexMap<AccountId, ResumableState>,
    /// Save time, stored as epoch milliseconds.
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub timestamp: SystemTime,
}

impl SessionDocument {
    /// Snapshots whose board does not have the expected tile count are rejected on load.
    pub fn is_usable(&self) -> bool {
        self.board.has_expected_shape()
    }

    /// Copy of the document with `updates` applied.
    pub fn with_updates(&self, updates: &FieldUpdates) -> Result<Self, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        apply_updates(&mut value, updates);
        serde_json::from_value(value)
    }
}

/// Apply every update to a JSON tree. Returns how many paths could be resolved.
pub fn apply_updates(root: &mut Value, updates: &FieldUpdates) -> usize {
    updates
        .iter()
        .filter(|(path, value)| apply_path(root, path, (*value).clone()))
        .count()
}

/// Write `value` at a slash-separated path, creating missing object keys.
///
/// Array segments must be in range; paths through scalars are rejected.
pub fn apply_path(root: &mut Value, path: &str, value: Value) -> bool {
    let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
    let mut cursor = root;
    while let Some(segment) = segments.next() {
        let last = segments.peek().is_none();
        match cursor {
            Value::Object(map) => {
                if last {
                    map.insert(segment.to_string(), value);
                    return true;
                }
                cursor = map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            Value::Array(items) => {
                let Some(item) = segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| items.get_mut(index))
                else {
                    return false;
                };
                if last {
                    *item = value;
                    return true;
                }
                cursor = item;
            }
            _ => return false,
        }
    }
    false
}
