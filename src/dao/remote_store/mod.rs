#[cfg(feature = "couch-store")]
pub mod couchdb;
pub mod memory;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{
    config::RemoteBackend,
    dao::{
        models::{FieldUpdates, SessionDocument},
        storage::StorageResult,
    },
};

/// Remote document store holding the single authoritative game snapshot.
pub trait RemoteStore: Send + Sync {
    /// Backend label used in logs.
    fn name(&self) -> &'static str;
    /// Replace the stored snapshot.
    fn save_document(&self, document: SessionDocument) -> BoxFuture<'static, StorageResult<()>>;
    /// Fetch the stored snapshot, if any.
    fn load_document(&self) -> BoxFuture<'static, StorageResult<Option<SessionDocument>>>;
    /// Patch individual fields of the stored snapshot.
    fn apply_updates(&self, updates: FieldUpdates) -> BoxFuture<'static, StorageResult<()>>;
    /// Cheap reachability check polled by the supervisor.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Re-establish the connection after a failed health check.
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// Factory opening a connection to the configured remote store.
pub type RemoteConnector =
    Arc<dyn Fn() -> BoxFuture<'static, StorageResult<Arc<dyn RemoteStore>>> + Send + Sync>;

/// Connector for `backend`, or `None` when only local snapshots are kept.
pub fn connector(backend: RemoteBackend) -> Option<RemoteConnector> {
    match backend {
        RemoteBackend::Disabled => None,
        RemoteBackend::Memory => {
            let store = memory::MemoryRemoteStore::new();
            Some(Arc::new(move || {
                let store = store.clone();
                Box::pin(async move { Ok(Arc::new(store) as Arc<dyn RemoteStore>) })
            }))
        }
        RemoteBackend::Couch => couch_connector(),
    }
}

#[cfg(feature = "couch-store")]
fn couch_connector() -> Option<RemoteConnector> {
    use couchdb::{CouchConfig, CouchRemoteStore};

    Some(Arc::new(|| {
        Box::pin(async move {
            let config = CouchConfig::from_env()?;
            let store = CouchRemoteStore::connect(config).await?;
            Ok(Arc::new(store) as Arc<dyn RemoteStore>)
        })
    }))
}

#[cfg(not(feature = "couch-store"))]
fn couch_connector() -> Option<RemoteConnector> {
    tracing::warn!("built without the couch-store feature; keeping local snapshots only");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_connector_reuses_one_store() {
        let connect = connector(RemoteBackend::Memory).unwrap();
        let first = connect().await.unwrap();
        first.save_document(memory_document()).await.unwrap();
        let second = connect().await.unwrap();
        assert!(second.load_document().await.unwrap().is_some());
        assert!(connector(RemoteBackend::Disabled).is_none());
    }

    fn memory_document() -> SessionDocument {
        use crate::state::{
            ledger::{Account, ScoreLedger},
            session::GameSession,
        };
        let ledger = ScoreLedger::new([Account::new("1", "Condor", "vuela741", false)]);
        GameSession::new(ledger).to_document(std::time::SystemTime::UNIX_EPOCH)
    }
}
