use std::time::{SystemTime, UNIX_EPOCH};

pub mod admin;
pub mod game;
pub mod health;
pub mod validation;
pub mod ws;

/// Milliseconds since the Unix epoch, saturating at zero for earlier times.
pub fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
