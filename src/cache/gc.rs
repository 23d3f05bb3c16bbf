//! Deferred eviction of entries nobody is subscribed to

use crate::cache::types::CacheKey;
use std::collections::HashMap;
use std::future::Future;
use tokio::task::AbortHandle;
use tracing::warn;

struct GcTimer {
    id: u64,
    handle: AbortHandle,
}

/// One pending eviction timer per key
#[derive(Default)]
pub(crate) struct GcScheduler {
    timers: HashMap<CacheKey, GcTimer>,
    next_id: u64,
}

impl GcScheduler {
    /// Arm the eviction timer for `key`, replacing any pending one
    ///
    /// `task` receives the timer id and must check it with [`is_armed`]
    /// before evicting. Returns `false` when no Tokio runtime is available.
    ///
    /// [`is_armed`]: GcScheduler::is_armed
    pub fn arm<F, Fut>(&mut self, key: &str, task: F) -> bool
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm(key);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No Tokio runtime, not scheduling eviction of {}", key);
                return false;
            }
        };

        self.next_id += 1;
        let id = self.next_id;
        let handle = runtime.spawn(task(id)).abort_handle();
        self.timers.insert(key.to_string(), GcTimer { id, handle });
        true
    }

    /// Cancel the pending timer for `key`, if any
    pub fn disarm(&mut self, key: &str) -> bool {
        match self.timers.remove(key) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether `id` is still the armed timer for `key`
    pub fn is_armed(&self, key: &str, id: u64) -> bool {
        self.timers.get(key).is_some_and(|timer| timer.id == id)
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.timers.contains_key(key)
    }

    /// Forget a timer that has fired, without aborting the running task
    pub fn complete(&mut self, key: &str) {
        self.timers.remove(key);
    }

    pub fn disarm_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }
}
