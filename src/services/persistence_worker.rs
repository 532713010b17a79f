//! Single writer for every persistence request.
//!
//! Requests are handled strictly in issue order, so two saves never overlap
//! and a save always reflects every transition issued before it. The worker
//! also owns the differential queue: queued field changes are coalesced and
//! written in one batch once the flush window elapses.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

use crate::dao::{
    models::{FieldUpdates, SessionDocument},
    persistence::{PersistenceEngine, SaveReport},
    storage::StorageError,
};

/// Quiet period between the first queued change and the batched write.
pub const DIFFERENTIAL_FLUSH_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Command {
    Save {
        document: Box<SessionDocument>,
        done: Option<oneshot::Sender<SaveReport>>,
    },
    Queue(FieldUpdates),
    Immediate(FieldUpdates),
    Flush(oneshot::Sender<()>),
}

/// Cheap handle feeding the persistence worker.
#[derive(Debug, Clone)]
pub struct PersistenceQueue {
    tx: mpsc::UnboundedSender<Command>,
}

impl PersistenceQueue {
    /// Request a full save without waiting for it.
    pub fn save(&self, document: SessionDocument) {
        self.send(Command::Save {
            document: Box::new(document),
            done: None,
        });
    }

    /// Add low-priority field changes to the debounced queue.
    pub fn queue(&self, updates: FieldUpdates) {
        if !updates.is_empty() {
            self.send(Command::Queue(updates));
        }
    }

    /// Write field changes right away, together with anything still queued.
    pub fn write_now(&self, updates: FieldUpdates) {
        if !updates.is_empty() {
            self.send(Command::Immediate(updates));
        }
    }

    /// Write queued changes now and wait until every earlier request completed.
    pub async fn flush(&self) -> bool {
        let (done, wait) = oneshot::channel();
        self.send(Command::Flush(done));
        wait.await.is_ok()
    }

    /// Full save that resolves once both tiers were attempted.
    pub async fn save_and_wait(&self, document: SessionDocument) -> Option<SaveReport> {
        let (done, wait) = oneshot::channel();
        self.send(Command::Save {
            document: Box::new(document),
            done: Some(done),
        });
        wait.await.ok()
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("persistence worker stopped; dropping request");
        }
    }
}

/// Start the worker. It runs until every [`PersistenceQueue`] is dropped.
pub fn spawn(engine: Arc<PersistenceEngine>) -> (PersistenceQueue, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run(engine, rx));
    (PersistenceQueue { tx }, handle)
}

async fn run(engine: Arc<PersistenceEngine>, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut pending = FieldUpdates::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => tokio::select! {
                command = rx.recv() => command,
                () = sleep_until(at) => {
                    deadline = None;
                    flush(&engine, &mut pending).await;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        let Some(command) = command else {
            flush(&engine, &mut pending).await;
            info!("persistence worker stopped");
            break;
        };

        match command {
            Command::Save { document, done } => {
                let report = engine.save(*document).await;
                if report.remote && !pending.is_empty() {
                    debug!(fields = pending.len(), "full save superseded queued changes");
                    pending.clear();
                    deadline = None;
                }
                if let Some(done) = done {
                    let _ = done.send(report);
                }
            }
            Command::Queue(updates) => {
                merge_updates(&mut pending, updates);
                if deadline.is_none() {
                    deadline = Some(Instant::now() + DIFFERENTIAL_FLUSH_WINDOW);
                }
            }
            Command::Immediate(updates) => {
                merge_updates(&mut pending, updates);
                deadline = None;
                flush(&engine, &mut pending).await;
            }
            Command::Flush(done) => {
                deadline = None;
                flush(&engine, &mut pending).await;
                let _ = done.send(());
            }
        }
    }
}

/// Newer values move to the end so they apply after any overlapping parent path.
fn merge_updates(pending: &mut FieldUpdates, updates: FieldUpdates) {
    for (path, value) in updates {
        pending.shift_remove(&path);
        pending.insert(path, value);
    }
}

async fn flush(engine: &PersistenceEngine, pending: &mut FieldUpdates) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    let fields = batch.len();
    match engine.apply_updates(batch).await {
        Ok(()) => debug!(fields, "differential changes written"),
        Err(StorageError::Detached) => {
            debug!(fields, "no remote store; dropping differential changes")
        }
        Err(err) => warn!(fields, error = %err, "dropping differential changes"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use serde_json::json;

    use super::*;
    use crate::{
        dao::{
            local_store::LocalSnapshotStore,
            remote_store::{RemoteStore, memory::MemoryRemoteStore},
        },
        state::{
            ledger::{Account, ScoreLedger},
            session::GameSession,
        },
    };

    fn document() -> SessionDocument {
        let ledger = ScoreLedger::new([Account::new("1", "Condor", "vuela741", false)]);
        GameSession::new(ledger).to_document(SystemTime::UNIX_EPOCH)
    }

    fn updates(pairs: &[(&str, serde_json::Value)]) -> FieldUpdates {
        pairs
            .iter()
            .map(|(path, value)| (path.to_string(), value.clone()))
            .collect()
    }

    async fn setup() -> (tempfile::TempDir, MemoryRemoteStore, PersistenceQueue) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(PersistenceEngine::new(LocalSnapshotStore::new(dir.path())));
        let remote = MemoryRemoteStore::new();
        remote.save_document(document()).await.unwrap();
        engine.install_remote(Arc::new(remote.clone())).await;
        let (queue, _handle) = spawn(engine);
        (dir, remote, queue)
    }

    #[tokio::test(start_paused = true)]
    async fn queued_changes_are_coalesced_into_one_write() {
        let (_dir, remote, queue) = setup().await;
        queue.queue(updates(&[("accounts/1/score", json!(50_000))]));
        queue.queue(updates(&[("counters/table_number", json!(4))]));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(remote.patch_count(), 0);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(remote.patch_count(), 1);
        let raw = remote.raw().await.unwrap();
        assert_eq!(raw["accounts"]["1"]["score"], 50_000);
        assert_eq!(raw["counters"]["table_number"], 4);
    }

    #[tokio::test]
    async fn immediate_writes_carry_queued_changes() {
        let (_dir, remote, queue) = setup().await;
        queue.queue(updates(&[("accounts/1/score", json!(10_000))]));
        queue.write_now(updates(&[("accounts/1/is_score_locked", json!(true))]));
        assert!(queue.flush().await);

        assert_eq!(remote.patch_count(), 1);
        let raw = remote.raw().await.unwrap();
        assert_eq!(raw["accounts"]["1"]["score"], 10_000);
        assert_eq!(raw["accounts"]["1"]["is_score_locked"], true);
    }

    #[tokio::test]
    async fn full_save_supersedes_pending_changes() {
        let (dir, remote, queue) = setup().await;
        queue.queue(updates(&[("status", json!("resetting"))]));
        let report = queue.save_and_wait(document()).await.unwrap();
        assert!(report.remote);
        assert!(queue.flush().await);

        assert_eq!(remote.patch_count(), 0);
        assert_eq!(remote.raw().await.unwrap()["status"], "playing");
        assert!(dir.path().join("game-state.json").exists());
    }

    #[test]
    fn later_values_move_behind_overlapping_paths() {
        let mut pending = updates(&[
            ("players/0/is_connected", json!(false)),
            ("players/0", json!({"is_connected": false})),
        ]);
        merge_updates(
            &mut pending,
            updates(&[("players/0/is_connected", json!(true))]),
        );
        let order: Vec<&str> = pending.keys().map(String::as_str).collect();
        assert_eq!(order, vec!["players/0", "players/0/is_connected"]);
        assert_eq!(pending["players/0/is_connected"], true);
    }
}
