use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::dao::{persistence::PersistenceEngine, remote_store::RemoteStore, storage::StorageError};

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Keep the remote store connected and the engine in degraded mode while it is unavailable.
///
/// A store already installed by the caller is monitored first; otherwise the
/// loop starts by connecting.
pub async fn run<F, Fut>(engine: Arc<PersistenceEngine>, mut connect: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Arc<dyn RemoteStore>, StorageError>> + Send,
{
    let mut delay = INITIAL_DELAY;

    loop {
        let store = match engine.remote().await {
            Some(store) => store,
            None => match connect().await {
                Ok(store) => {
                    engine.install_remote(store.clone()).await;
                    info!(store = store.name(), "remote store connected");
                    store
                }
                Err(err) => {
                    warn!(error = %err, "remote store connection attempt failed");
                    sleep(delay).await;
                    delay = (delay * 2).min(MAX_DELAY);
                    continue;
                }
            },
        };
        delay = INITIAL_DELAY;

        if monitor(&engine, store.as_ref()).await {
            continue;
        }
        warn!("exhausted remote store reconnect attempts; staying in degraded mode");
        engine.clear_remote().await;
        sleep(delay).await;
        delay = (delay * 2).min(MAX_DELAY);
    }
}

/// Poll the store until it fails and cannot be revived. Returns `true` when
/// the store was replaced underneath the supervisor.
async fn monitor(engine: &PersistenceEngine, store: &dyn RemoteStore) -> bool {
    loop {
        match store.health_check().await {
            Ok(()) => {
                if engine.is_degraded() {
                    info!(store = store.name(), "remote store healthy again");
                    engine.set_degraded(false);
                }
                sleep(HEALTH_POLL_INTERVAL).await;
            }
            Err(err) => {
                warn!(store = store.name(), error = %err, "remote store health check failed");
                if !reconnect(engine, store).await {
                    return false;
                }
                engine.set_degraded(false);
                sleep(HEALTH_POLL_INTERVAL).await;
            }
        }

        if engine.remote().await.is_none() {
            return true;
        }
    }
}

async fn reconnect(engine: &PersistenceEngine, store: &dyn RemoteStore) -> bool {
    let mut reconnect_delay = INITIAL_DELAY;
    for attempt in 0..MAX_RECONNECT_ATTEMPTS {
        match store.try_reconnect().await {
            Ok(()) => {
                info!(store = store.name(), attempt, "remote store reconnected");
                return true;
            }
            Err(err) => {
                if attempt == 0 {
                    warn!(
                        attempt, error = %err,
                        "remote store reconnect first attempt failed; entering degraded mode"
                    );
                    engine.set_degraded(true);
                } else {
                    warn!(attempt, error = %err, "remote store reconnect attempt failed");
                }
                sleep(reconnect_delay).await;
                reconnect_delay = (reconnect_delay * 2).min(MAX_DELAY);
            }
        }
    }
    false
}
