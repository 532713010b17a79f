//! Rotating JSON snapshots on the local filesystem.
//!
//! Every save shifts the previous snapshots down one slot before writing the
//! new primary, so the directory always holds the last three good states:
//! `game-state.json`, `game-state.backup1.json` and `game-state.backup2.json`.
//! All writes go through a temporary file in the same directory followed by a
//! rename, so a crash never leaves a truncated snapshot behind.

use std::{
    fmt::Display,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, warn};

use crate::dao::models::SessionDocument;

/// Newest snapshot.
pub const PRIMARY_FILE: &str = "game-state.json";
/// Older generations, newest first.
pub const BACKUP_FILES: [&str; 2] = ["game-state.backup1.json", "game-state.backup2.json"];
/// Append-only log of failed writes.
pub const ERROR_LOG_FILE: &str = "error-log.txt";

/// Failures writing local snapshots.
#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("i/o failure on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode snapshot")]
    Encode(#[source] serde_json::Error),
}

impl LocalStoreError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Which file a snapshot was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFile {
    Primary,
    Backup1,
    Backup2,
}

impl SnapshotFile {
    const ORDER: [SnapshotFile; 3] = [Self::Primary, Self::Backup1, Self::Backup2];

    fn file_name(self) -> &'static str {
        match self {
            Self::Primary => PRIMARY_FILE,
            Self::Backup1 => BACKUP_FILES[0],
            Self::Backup2 => BACKUP_FILES[1],
        }
    }
}

/// Snapshot directory handle.
#[derive(Debug, Clone)]
pub struct LocalSnapshotStore {
    dir: PathBuf,
}

impl LocalSnapshotStore {
    /// Store rooted at `dir`; the directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the snapshot files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a snapshot slot.
    pub fn path_of(&self, file: SnapshotFile) -> PathBuf {
        self.dir.join(file.file_name())
    }

    /// Rotate the backups and write `document` as the new primary.
    ///
    /// When the primary cannot be written the snapshot goes straight to
    /// backup1, then backup2. Every failure is appended to the error log.
    /// Returns the slot that received the snapshot.
    pub fn save(&self, document: &SessionDocument) -> Result<SnapshotFile, LocalStoreError> {
        let bytes = serde_json::to_vec_pretty(document).map_err(LocalStoreError::Encode)?;
        if let Err(err) = fs::create_dir_all(&self.dir) {
            let err = LocalStoreError::io(&self.dir)(err);
            self.append_error("create snapshot directory", &err);
            return Err(err);
        }
        if let Err(err) = self.rotate() {
            warn!(error = %err, "backup rotation failed");
            self.append_error("rotate backups", &err);
        }

        let mut outcome = self.write_slot(SnapshotFile::Primary, &bytes);
        for fallback in [SnapshotFile::Backup1, SnapshotFile::Backup2] {
            let Err(err) = &outcome else {
                break;
            };
            warn!(error = %err, fallback = fallback.file_name(), "snapshot write failed; falling back");
            self.append_error("write snapshot", err);
            outcome = self.write_slot(fallback, &bytes);
        }
        if let Err(err) = &outcome {
            self.append_error("write snapshot", err);
        }
        outcome
    }

    fn write_slot(&self, file: SnapshotFile, bytes: &[u8]) -> Result<SnapshotFile, LocalStoreError> {
        let path = self.path_of(file);
        atomic_write(&path, bytes)?;
        debug!(path = %path.display(), "local snapshot written");
        Ok(file)
    }

    /// backup1 -> backup2, then primary -> backup1. Missing sources are skipped.
    fn rotate(&self) -> Result<(), LocalStoreError> {
        let steps = [
            (SnapshotFile::Backup1, SnapshotFile::Backup2),
            (SnapshotFile::Primary, SnapshotFile::Backup1),
        ];
        for (from, to) in steps {
            let source = self.path_of(from);
            let bytes = match fs::read(&source) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(LocalStoreError::io(&source)(err)),
            };
            atomic_write(&self.path_of(to), &bytes)?;
        }
        Ok(())
    }

    /// Read a single slot. Unreadable, corrupt or malformed snapshots yield `None`.
    pub fn read(&self, file: SnapshotFile) -> Option<SessionDocument> {
        let path = self.path_of(file);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read local snapshot");
                return None;
            }
        };
        match serde_json::from_slice::<SessionDocument>(&bytes) {
            Ok(document) if document.is_usable() => Some(document),
            Ok(document) => {
                warn!(
                    path = %path.display(),
                    tiles = document.board.len(),
                    "local snapshot has a malformed board"
                );
                None
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "local snapshot is corrupt");
                None
            }
        }
    }

    /// First usable snapshot in primary, backup1, backup2 order.
    pub fn load(&self) -> Option<(SnapshotFile, SessionDocument)> {
        SnapshotFile::ORDER
            .into_iter()
            .find_map(|file| self.read(file).map(|document| (file, document)))
    }

    /// Append `<RFC3339 timestamp> - <context>: <error>` to the error log.
    pub fn append_error(&self, context: &str, error: &dyn Display) {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown-time".into());
        let path = self.dir.join(ERROR_LOG_FILE);
        let result = fs::create_dir_all(&self.dir).and_then(|()| {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{timestamp} - {context}: {error}")
        });
        if let Err(err) = result {
            warn!(path = %path.display(), error = %err, "failed to append to error log");
        }
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), LocalStoreError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(parent).map_err(LocalStoreError::io(parent))?;
    tmp.write_all(bytes).map_err(LocalStoreError::io(tmp.path()))?;
    tmp.as_file()
        .sync_all()
        .map_err(LocalStoreError::io(path))?;
    tmp.persist(path)
        .map_err(|err| LocalStoreError::io(path)(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::state::{
        ledger::{Account, ScoreLedger},
        session::GameSession,
    };

    fn document(table_number: u32) -> SessionDocument {
        let ledger = ScoreLedger::new([Account::new("1", "Condor", "vuela741", false)]);
        let mut document = GameSession::new(ledger)
            .to_document(SystemTime::UNIX_EPOCH + Duration::from_secs(table_number as u64));
        document.counters.table_number = table_number;
        document
    }

    fn table(store: &LocalSnapshotStore, file: SnapshotFile) -> Option<u32> {
        store.read(file).map(|doc| doc.counters.table_number)
    }

    #[test]
    fn saves_rotate_through_backups() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalSnapshotStore::new(dir.path());

        store.save(&document(1)).unwrap();
        assert_eq!(table(&store, SnapshotFile::Primary), Some(1));
        assert_eq!(table(&store, SnapshotFile::Backup1), None);

        store.save(&document(2)).unwrap();
        store.save(&document(3)).unwrap();
        assert_eq!(table(&store, SnapshotFile::Primary), Some(3));
        assert_eq!(table(&store, SnapshotFile::Backup1), Some(2));
        assert_eq!(table(&store, SnapshotFile::Backup2), Some(1));

        store.save(&document(4)).unwrap();
        assert_eq!(table(&store, SnapshotFile::Backup2), Some(2));
    }

    #[test]
    fn unwritable_primary_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalSnapshotStore::new(dir.path());
        fs::create_dir_all(store.path_of(SnapshotFile::Primary)).unwrap();

        assert_eq!(store.save(&document(7)).unwrap(), SnapshotFile::Backup1);
        let (file, loaded) = store.load().unwrap();
        assert_eq!(file, SnapshotFile::Backup1);
        assert_eq!(loaded.counters.table_number, 7);

        let log = fs::read_to_string(dir.path().join(ERROR_LOG_FILE)).unwrap();
        assert!(log.contains("write snapshot"));
    }

    #[test]
    fn load_round_trips_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalSnapshotStore::new(dir.path());
        let original = document(5);
        assert_eq!(store.save(&original).unwrap(), SnapshotFile::Primary);
        let (file, loaded) = store.load().unwrap();
        assert_eq!(file, SnapshotFile::Primary);
        assert_eq!(loaded, original);
    }

    #[test]
    fn load_falls_back_past_corrupt_and_malformed_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalSnapshotStore::new(dir.path());
        store.save(&document(1)).unwrap();
        store.save(&document(2)).unwrap();
        store.save(&document(3)).unwrap();

        fs::write(store.path_of(SnapshotFile::Primary), b"{ not json").unwrap();
        let mut short = serde_json::to_value(document(9)).unwrap();
        short["board"] = serde_json::json!([]);
        fs::write(
            store.path_of(SnapshotFile::Backup1),
            serde_json::to_vec(&short).unwrap(),
        )
        .unwrap();

        let (file, loaded) = store.load().unwrap();
        assert_eq!(file, SnapshotFile::Backup2);
        assert_eq!(loaded.counters.table_number, 1);
    }

    #[test]
    fn empty_directory_has_nothing_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalSnapshotStore::new(dir.path().join("missing"));
        assert!(store.load().is_none());
    }

    #[test]
    fn error_log_lines_are_timestamped() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalSnapshotStore::new(dir.path());
        store.append_error("remote save", &"connection refused");
        store.append_error("remote save", &"timeout");
        let log = fs::read_to_string(dir.path().join(ERROR_LOG_FILE)).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" - remote save: connection refused"));
        assert!(OffsetDateTime::parse(lines[0].split(" - ").next().unwrap(), &Rfc3339).is_ok());
    }
}
