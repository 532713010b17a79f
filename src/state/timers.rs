//! Cancellable delayed tasks, at most one per key.

use std::{fmt::Debug, future::Future, hash::Hash, time::Duration};

use dashmap::DashMap;
use tokio::{task::JoinHandle, time::sleep};
use tracing::trace;

/// Keys of the session's scheduled tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKey {
    /// Turn expiry, rotation and post-reset resume share one slot.
    Turn,
}

/// Registry of pending delayed tasks.
///
/// Scheduling under a key aborts whatever was pending under it. Once the
/// delay elapses the work is detached from the registry, so replacing or
/// cancelling a key never interrupts work that already started.
pub struct TaskRegistry<K> {
    tasks: DashMap<K, JoinHandle<()>>,
}

impl<K> Default for TaskRegistry<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }
}

impl<K> TaskRegistry<K>
where
    K: Eq + Hash + Debug + Clone,
{
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` after `delay`, replacing any task pending under `key`.
    pub fn schedule<F>(&self, key: K, delay: Duration, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            tokio::spawn(work);
        });
        if let Some(previous) = self.tasks.insert(key.clone(), handle) {
            previous.abort();
            trace!(key = ?key, "replaced pending task");
        }
    }

    /// Abort every pending task.
    pub fn cancel_all(&self) {
        self.tasks.retain(|_, handle| {
            handle.abort();
            false
        });
    }

    /// True while a task under `key` is still waiting for its delay.
    pub fn is_pending(&self, key: &K) -> bool {
        self.tasks
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }
}
