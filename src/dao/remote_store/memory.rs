//! In-process remote store, used when no database is configured and in tests.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use super::RemoteStore;
use crate::dao::{
    models::{FieldUpdates, SessionDocument, apply_updates},
    storage::{StorageError, StorageResult},
};

/// Failure reported while the store is switched offline.
#[derive(Debug, Error)]
#[error("memory store is offline")]
pub struct Offline;

/// One successful write, in the order the store accepted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    /// Full document save.
    Save,
    /// Field-update batch with its paths.
    Patch(Vec<String>),
}

#[derive(Default)]
struct Inner {
    document: Mutex<Option<Value>>,
    journal: Mutex<Vec<Write>>,
    offline: AtomicBool,
    saves: AtomicUsize,
    patches: AtomicUsize,
}

/// Keeps the snapshot as a JSON tree so partial updates behave like a document database.
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    inner: Arc<Inner>,
}

impl MemoryRemoteStore {
    /// Empty, online store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of successful full saves.
    pub fn save_count(&self) -> usize {
        self.inner.saves.load(Ordering::SeqCst)
    }

    /// Number of successful field-update batches.
    pub fn patch_count(&self) -> usize {
        self.inner.patches.load(Ordering::SeqCst)
    }

    /// Successful writes, oldest first.
    pub async fn writes(&self) -> Vec<Write> {
        self.inner.journal.lock().await.clone()
    }

    /// Raw stored tree.
    pub async fn raw(&self) -> Option<Value> {
        self.inner.document.lock().await.clone()
    }

    /// Overwrite the stored tree directly.
    pub async fn put_raw(&self, value: Option<Value>) {
        *self.inner.document.lock().await = value;
    }

    fn check_online(&self, action: &str) -> StorageResult<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            Err(StorageError::unavailable(
                format!("memory store rejected {action}"),
                Offline,
            ))
        } else {
            Ok(())
        }
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn save_document(&self, document: SessionDocument) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_online("save")?;
            let value = serde_json::to_value(&document)
                .map_err(|err| StorageError::corrupt("encode snapshot".into(), err))?;
            *store.inner.document.lock().await = Some(value);
            store.inner.saves.fetch_add(1, Ordering::SeqCst);
            store.inner.journal.lock().await.push(Write::Save);
            Ok(())
        })
    }

    fn load_document(&self) -> BoxFuture<'static, StorageResult<Option<SessionDocument>>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_online("load")?;
            let Some(value) = store.inner.document.lock().await.clone() else {
                return Ok(None);
            };
            serde_json::from_value(value)
                .map(Some)
                .map_err(|err| StorageError::corrupt("decode snapshot".into(), err))
        })
    }

    fn apply_updates(&self, updates: FieldUpdates) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_online("field updates")?;
            let mut guard = store.inner.document.lock().await;
            if let Some(root) = guard.as_mut() {
                apply_updates(root, &updates);
                store.inner.patches.fetch_add(1, Ordering::SeqCst);
                store
                    .inner
                    .journal
                    .lock()
                    .await
                    .push(Write::Patch(updates.keys().cloned().collect()));
            }
            Ok(())
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.check_online("health check") })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.check_online("reconnect") })
    }
}
