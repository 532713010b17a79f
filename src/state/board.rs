//! Tile layout generation and the balance rules every board must satisfy.

use std::time::SystemTime;

use rand::{Rng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::state::ledger::AccountId;

/// Number of tiles on a board.
pub const BOARD_SIZE: usize = 16;
/// Width of one sub-row; each sub-row holds half gain and half loss tiles.
pub const ROW_WIDTH: usize = 4;
/// Points awarded by a gain tile.
pub const GAIN_VALUE: i64 = 15_000;
/// Points removed by a loss tile.
pub const LOSS_VALUE: i64 = -16_000;

const GAINS_PER_ROW: usize = ROW_WIDTH / 2;

/// One cell of the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    /// Signed point value applied to the revealer's score.
    pub value: i64,
    /// Whether the tile has been revealed during the current cycle.
    #[serde(default)]
    pub revealed: bool,
    /// Account that revealed the tile.
    #[serde(default)]
    pub revealed_by: Option<AccountId>,
    /// Moment the tile was revealed.
    #[serde(default)]
    pub revealed_at: Option<SystemTime>,
}

impl Tile {
    fn hidden(value: i64) -> Self {
        Self {
            value,
            revealed: false,
            revealed_by: None,
            revealed_at: None,
        }
    }

    /// True when the tile carries a gain value.
    pub fn is_gain(&self) -> bool {
        self.value == GAIN_VALUE
    }

    /// True when the tile carries a loss value.
    pub fn is_loss(&self) -> bool {
        self.value == LOSS_VALUE
    }
}

/// Ordered tiles of the current cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Board {
    tiles: Vec<Tile>,
}

impl Board {
    /// Generate a fresh board from the thread-local random source.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::rng())
    }

    /// Generate a board where each sub-row is shuffled independently from `rng`.
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut tiles = Vec::with_capacity(BOARD_SIZE);
        for _ in 0..BOARD_SIZE / ROW_WIDTH {
            let mut row: Vec<i64> = (0..ROW_WIDTH)
                .map(|slot| {
                    if slot < GAINS_PER_ROW {
                        GAIN_VALUE
                    } else {
                        LOSS_VALUE
                    }
                })
                .collect();
            row.shuffle(rng);
            tiles.extend(row.into_iter().map(Tile::hidden));
        }
        Self { tiles }
    }

    /// Wrap tiles loaded from storage without checking them.
    pub fn from_tiles(tiles: Vec<Tile>) -> Self {
        Self { tiles }
    }

    /// Borrow the tiles in board order.
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// Borrow a single tile.
    pub fn tile(&self, index: usize) -> Option<&Tile> {
        self.tiles.get(index)
    }

    /// Number of tiles on the board.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// True when the board holds no tile at all.
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Structural check used when accepting a persisted board.
    pub fn has_expected_shape(&self) -> bool {
        self.tiles.len() == BOARD_SIZE
    }

    /// Check the global and per-row gain/loss balance.
    pub fn is_balanced(&self) -> bool {
        if !self.has_expected_shape() {
            return false;
        }
        self.tiles.chunks(ROW_WIDTH).all(|row| {
            let gains = row.iter().filter(|tile| tile.is_gain()).count();
            let losses = row.iter().filter(|tile| tile.is_loss()).count();
            gains == GAINS_PER_ROW && losses == ROW_WIDTH - GAINS_PER_ROW
        })
    }

    /// Number of revealed tiles.
    pub fn revealed_count(&self) -> usize {
        self.tiles.iter().filter(|tile| tile.revealed).count()
    }

    /// True once every tile has been revealed.
    pub fn all_revealed(&self) -> bool {
        !self.tiles.is_empty() && self.tiles.iter().all(|tile| tile.revealed)
    }

    /// Mark a tile revealed and return the value to apply.
    ///
    /// Values outside the two legal magnitudes are clamped to the nearest one
    /// before being returned. Returns `None` when the index is out of range or
    /// the tile is already revealed.
    pub fn reveal(&mut self, index: usize, by: &str, at: SystemTime) -> Option<i64> {
        let tile = self.tiles.get_mut(index)?;
        if tile.revealed {
            return None;
        }
        let value = sanitize_value(tile.value);
        if value != tile.value {
            warn!(index, value = tile.value, clamped = value, "clamping corrupt tile value");
            tile.value = value;
        }
        tile.revealed = true;
        tile.revealed_by = Some(by.to_string());
        tile.revealed_at = Some(at);
        Some(value)
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::generate()
    }
}

/// Clamp a tile value to the nearest legal signed magnitude.
pub fn sanitize_value(value: i64) -> i64 {
    match value {
        GAIN_VALUE | LOSS_VALUE => value,
        v if v > 0 => GAIN_VALUE,
        _ => LOSS_VALUE,
    }
}
