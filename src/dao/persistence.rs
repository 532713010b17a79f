//! Tiered save/load over the remote store and the local snapshot files.

use std::sync::Arc;

use tokio::{
    sync::{RwLock, watch},
    task,
};
use tracing::{error, info, warn};

use crate::dao::{
    local_store::{LocalSnapshotStore, SnapshotFile},
    models::{FieldUpdates, SessionDocument},
    remote_store::RemoteStore,
    storage::{StorageError, StorageResult},
};

/// Tiers that accepted a save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// The remote store accepted the snapshot.
    pub remote: bool,
    /// Local slot that received the snapshot, if any.
    pub local: Option<SnapshotFile>,
}

impl SaveReport {
    /// At least one tier holds the snapshot.
    pub fn is_durable(&self) -> bool {
        self.remote || self.local.is_some()
    }
}

/// Where a loaded snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Remote,
    Local(SnapshotFile),
}

/// Owns both storage tiers and the degraded flag.
pub struct PersistenceEngine {
    local: LocalSnapshotStore,
    remote: RwLock<Option<Arc<dyn RemoteStore>>>,
    degraded: watch::Sender<bool>,
}

impl PersistenceEngine {
    /// Engine without a remote store; it stays degraded until one is installed.
    pub fn new(local: LocalSnapshotStore) -> Self {
        let (degraded, _rx) = watch::channel(true);
        Self {
            local,
            remote: RwLock::new(None),
            degraded,
        }
    }

    /// Local snapshot tier.
    pub fn local(&self) -> &LocalSnapshotStore {
        &self.local
    }

    /// Current remote store, if any.
    pub async fn remote(&self) -> Option<Arc<dyn RemoteStore>> {
        self.remote.read().await.as_ref().cloned()
    }

    /// Install a remote store and leave degraded mode.
    pub async fn install_remote(&self, store: Arc<dyn RemoteStore>) {
        *self.remote.write().await = Some(store);
        self.set_degraded(false);
    }

    /// Drop the remote store and enter degraded mode.
    pub async fn clear_remote(&self) {
        self.remote.write().await.take();
        self.set_degraded(true);
    }

    /// True while no remote store is usable.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Update the degraded flag, logging only on change.
    pub fn set_degraded(&self, value: bool) {
        let changed = self.degraded.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
        if changed {
            if value {
                warn!("remote store unavailable; entering degraded mode");
            } else {
                info!("remote store available; leaving degraded mode");
            }
        }
    }

    async fn record_error(&self, context: &'static str, err: &StorageError) {
        let local = self.local.clone();
        let message = err.to_string();
        let logged =
            task::spawn_blocking(move || local.append_error(context, &message)).await;
        if let Err(join) = logged {
            warn!(error = %join, "error log task failed");
        }
    }

    /// Write the snapshot to the remote store and, regardless of that
    /// outcome, to the rotating local files.
    pub async fn save(&self, document: SessionDocument) -> SaveReport {
        let remote = match self.remote().await {
            Some(store) => match store.save_document(document.clone()).await {
                Ok(()) => {
                    self.set_degraded(false);
                    true
                }
                Err(err) => {
                    warn!(store = store.name(), error = %err, "remote save failed");
                    self.record_error("remote save", &err).await;
                    self.set_degraded(true);
                    false
                }
            },
            None => false,
        };

        let local = self.local.clone();
        let local = match task::spawn_blocking(move || local.save(&document)).await {
            Ok(Ok(file)) => Some(file),
            Ok(Err(err)) => {
                warn!(error = %err, "local snapshot save failed");
                None
            }
            Err(join) => {
                warn!(error = %join, "local snapshot task failed");
                None
            }
        };

        let report = SaveReport { remote, local };
        if !report.is_durable() {
            error!("snapshot could not be persisted to any tier");
        }
        report
    }

    /// Patch fields on the remote snapshot.
    pub async fn apply_updates(&self, updates: FieldUpdates) -> StorageResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let store = self.remote().await.ok_or(StorageError::Detached)?;
        match store.apply_updates(updates).await {
            Ok(()) => {
                self.set_degraded(false);
                Ok(())
            }
            Err(err) => {
                warn!(store = store.name(), error = %err, "remote field update failed");
                self.record_error("remote field update", &err).await;
                self.set_degraded(true);
                Err(err)
            }
        }
    }

    /// Load the newest usable snapshot: remote first, then primary, backup1
    /// and backup2. A snapshot recovered from disk is written back to a
    /// reachable remote store.
    pub async fn load(&self) -> Option<(LoadSource, SessionDocument)> {
        let remote = self.remote().await;
        if let Some(store) = &remote {
            match store.load_document().await {
                Ok(Some(document)) if document.is_usable() => {
                    info!(store = store.name(), "snapshot loaded from remote store");
                    return Some((LoadSource::Remote, document));
                }
                Ok(Some(document)) => {
                    warn!(tiles = document.board.len(), "remote snapshot has a malformed board");
                }
                Ok(None) => info!(store = store.name(), "remote store holds no snapshot"),
                Err(err) => {
                    warn!(store = store.name(), error = %err, "remote load failed");
                    self.record_error("remote load", &err).await;
                }
            }
        }

        let local = self.local.clone();
        let (file, document) = match task::spawn_blocking(move || local.load()).await {
            Ok(found) => found?,
            Err(join) => {
                warn!(error = %join, "local load task failed");
                return None;
            }
        };
        info!(file = ?file, "snapshot restored from local file");

        if let Some(store) = remote {
            match store.save_document(document.clone()).await {
                Ok(()) => info!(store = store.name(), "remote store repaired from local snapshot"),
                Err(err) => warn!(store = store.name(), error = %err, "remote repair failed"),
            }
        }
        Some((LoadSource::Local(file), document))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use serde_json::json;

    use super::*;
    use crate::{
        dao::remote_store::memory::MemoryRemoteStore,
        state::{
            ledger::{Account, ScoreLedger},
            session::GameSession,
        },
    };

    fn document(table_number: u32) -> SessionDocument {
        let ledger = ScoreLedger::new([
            Account::new("1", "Condor", "vuela741", false),
            Account::new("admin", "admin", "admin1998", true),
        ]);
        let mut session = GameSession::new(ledger);
        session.join("1", None, SystemTime::UNIX_EPOCH).unwrap();
        let mut document =
            session.to_document(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        document.counters.table_number = table_number;
        document
    }

    async fn engine_with_remote() -> (tempfile::TempDir, PersistenceEngine, MemoryRemoteStore) {
        let dir = tempfile::tempdir().unwrap();
        let engine = PersistenceEngine::new(LocalSnapshotStore::new(dir.path()));
        let remote = MemoryRemoteStore::new();
        engine.install_remote(Arc::new(remote.clone())).await;
        (dir, engine, remote)
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let (_dir, engine, _remote) = engine_with_remote().await;
        let saved = document(3);
        let report = engine.save(saved.clone()).await;
        assert!(report.remote);
        assert_eq!(report.local, Some(SnapshotFile::Primary));

        let (source, loaded) = engine.load().await.unwrap();
        assert_eq!(source, LoadSource::Remote);
        assert_eq!(loaded, saved);
    }

    #[tokio::test]
    async fn remote_failure_still_saves_locally_and_degrades() {
        let (dir, engine, remote) = engine_with_remote().await;
        remote.set_offline(true);
        let report = engine.save(document(1)).await;
        assert!(!report.remote);
        assert!(report.is_durable());
        assert!(engine.is_degraded());

        let log = std::fs::read_to_string(dir.path().join("error-log.txt")).unwrap();
        assert!(log.contains("remote save"));

        remote.set_offline(false);
        engine.save(document(2)).await;
        assert!(!engine.is_degraded());
    }

    #[tokio::test]
    async fn local_snapshot_repairs_remote() {
        let (_dir, engine, remote) = engine_with_remote().await;
        remote.set_offline(true);
        engine.save(document(4)).await;
        remote.set_offline(false);
        assert!(remote.raw().await.is_none());

        let (source, loaded) = engine.load().await.unwrap();
        assert_eq!(source, LoadSource::Local(SnapshotFile::Primary));
        assert_eq!(loaded.counters.table_number, 4);
        assert_eq!(remote.save_count(), 1);
    }

    #[tokio::test]
    async fn malformed_remote_board_falls_back_to_disk() {
        let (_dir, engine, remote) = engine_with_remote().await;
        engine.save(document(5)).await;
        let mut raw = remote.raw().await.unwrap();
        raw["board"] = json!([]);
        remote.put_raw(Some(raw)).await;

        let (source, loaded) = engine.load().await.unwrap();
        assert_eq!(source, LoadSource::Local(SnapshotFile::Primary));
        assert_eq!(loaded.counters.table_number, 5);
    }

    #[tokio::test]
    async fn nothing_to_load_without_any_snapshot() {
        let (_dir, engine, _remote) = engine_with_remote().await;
        assert!(engine.load().await.is_none());
    }

    #[tokio::test]
    async fn field_updates_require_a_remote() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PersistenceEngine::new(LocalSnapshotStore::new(dir.path()));
        let mut updates = FieldUpdates::new();
        updates.insert("status".into(), json!("playing"));
        assert!(matches!(
            engine.apply_updates(updates).await,
            Err(StorageError::Detached)
        ));
    }
}
