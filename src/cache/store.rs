//! Query cache engine: fetch orchestration, background revalidation and entry lifecycle

use crate::cache::{
    config::QueryCacheConfig,
    entry::CacheEntry,
    events::{CacheEvent, CacheEventKind, RemovalReason},
    gc::GcScheduler,
    in_flight::{FetchKind, InFlight, InFlightRegistry},
    state::{QueryState, QueryStatus, UpdatedAt},
    subscribers::{Listener, SubscriberRegistry, Subscription, SubscriptionId},
    types::{CacheKey, CacheStats, Completion, QueryFn, SharedCompletion},
};
use crate::error::{CacheError, QueryError, Result};
use futures::future::{self, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Stale-while-revalidate query cache
///
/// This implementation provides:
/// - At most one fetch in flight per key; concurrent callers join it
/// - Background revalidation that keeps the previous data visible
/// - Synchronous change notification per key
/// - Eviction of unwatched entries after a grace period
///
/// The handle is cheap to clone; clones share one cache. Operations that may
/// start a fetch spawn it on the current Tokio runtime.
pub struct QueryCache<T> {
    inner: Arc<CacheInner<T>>,
}

struct CacheInner<T> {
    config: QueryCacheConfig,

    /// Internal storage; never held across an await or a listener call
    store: Mutex<CacheStore<T>>,

    events: broadcast::Sender<CacheEvent>,
}

/// Internal cache storage
struct CacheStore<T> {
    /// Main storage: key -> entry
    entries: HashMap<CacheKey, CacheEntry<T>>,

    in_flight: InFlightRegistry,

    subscribers: SubscriberRegistry,

    gc: GcScheduler,

    stats: CacheStats,
}

impl<T> Clone for QueryCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> QueryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new cache with the given configuration
    pub fn new(config: QueryCacheConfig) -> Self {
        info!("Initializing query cache with config: {:?}", config);

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let store = CacheStore {
            entries: HashMap::new(),
            in_flight: InFlightRegistry::default(),
            subscribers: SubscriberRegistry::default(),
            gc: GcScheduler::default(),
            stats: CacheStats::default(),
        };

        Self {
            inner: Arc::new(CacheInner {
                config,
                store: Mutex::new(store),
                events,
            }),
        }
    }

    /// Create a cache with default configuration
    pub fn with_defaults() -> Self {
        Self::new(QueryCacheConfig::default())
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.inner.config
    }

    /// Ensure `key` holds fresh-or-cached data
    ///
    /// Without usable data (missing, idle, loading or failed entry) this runs a
    /// direct fetch; otherwise it records `query_fn` and revalidates in the
    /// background if the data is stale. The returned future resolves once the
    /// fetch it started or joined has settled, or immediately if none ran.
    pub fn fetch_query(
        &self,
        key: &str,
        query_fn: QueryFn<T>,
        initial_data: Option<T>,
    ) -> Completion {
        let direct = {
            let mut store = self.inner.store.lock();
            match store.entries.get_mut(key) {
                Some(entry)
                    if matches!(
                        entry.state,
                        QueryState::Fetching { .. }
                            | QueryState::FirstSuccess { .. }
                            | QueryState::Success { .. }
                    ) =>
                {
                    entry.query_fn = Some(Arc::clone(&query_fn));
                    false
                }
                _ => true,
            }
        };

        if direct {
            self.direct_fetch(key, query_fn, initial_data)
        } else {
            self.background_fetch(key)
        }
    }

    /// Always run a direct fetch with the recorded fetch function
    pub fn refetch_query(&self, key: &str) -> Completion {
        let query_fn = self
            .inner
            .store
            .lock()
            .entries
            .get(key)
            .and_then(|entry| entry.query_fn.clone());

        match query_fn {
            Some(query_fn) => self.direct_fetch(key, query_fn, None),
            None => {
                warn!("Refetch requested without a fetch function: {}", key);
                future::ready(Err(CacheError::MissingQueryFn {
                    key: key.to_string(),
                }))
                .boxed()
            }
        }
    }

    /// Mark `key` as stale, notify, then revalidate in the background
    pub fn invalidate_query(&self, key: &str) -> Completion {
        if !self.mark_invalidated(key) {
            return ready_ok();
        }
        self.background_fetch(key)
    }

    /// Like [`invalidate_query`](Self::invalidate_query), for callers that
    /// will not await the revalidation
    ///
    /// Without a Tokio runtime the entry is only marked stale.
    pub fn invalidate_query_detached(&self, key: &str) {
        if self.mark_invalidated(key) {
            self.revalidate_detached(key);
        }
    }

    /// Abandon the in-flight fetch for `key`
    ///
    /// The fetch itself keeps running; its result is discarded when it
    /// settles. Returns `false` when nothing was in flight.
    pub fn cancel_query(&self, key: &str) -> bool {
        let fetch = {
            let mut guard = self.inner.store.lock();
            let store = &mut *guard;
            let Some(fetch) = store.in_flight.remove(key) else {
                return false;
            };

            if let Some(entry) = store.entries.get_mut(key) {
                let data = std::mem::take(&mut entry.state).into_data();
                entry.state = QueryState::Idle {
                    data,
                    updated_at: UpdatedAt::ForceStale,
                };
            }
            store.stats.cancellations += 1;
            fetch
        };

        debug!("Cancelled {:?} fetch: {}", fetch.kind, key);
        self.emit(CacheEvent::new(CacheEventKind::Cancelled, key));
        self.emit(CacheEvent::updated(key, QueryStatus::Idle));
        self.notify(key);
        true
    }

    /// Overwrite the data of `key` without fetching
    pub fn set_data(&self, key: &str, data: T) {
        let is_new = {
            let mut store = self.inner.store.lock();
            let is_new = !store.entries.contains_key(key);
            store
                .entries
                .entry(key.to_string())
                .or_insert_with(|| CacheEntry::new(None))
                .record_data(data, false);
            is_new
        };

        debug!("Set query data: {}", key);
        if is_new {
            self.emit(CacheEvent::new(CacheEventKind::Added, key));
        }
        self.emit(CacheEvent::updated(key, QueryStatus::Success));
        self.notify(key);
    }

    /// Read an entry, revalidating it in the background if it is stale
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry<T>> {
        self.revalidate_detached(key);

        let mut guard = self.inner.store.lock();
        let store = &mut *guard;
        let entry = store.entries.get(key).cloned();

        if entry.as_ref().and_then(|e| e.state.data()).is_some() {
            store.stats.hits += 1;
            trace!("Cache hit: {}", key);
        } else {
            store.stats.misses += 1;
            trace!("Cache miss: {}", key);
        }
        entry
    }

    /// Read an entry without side effects
    pub fn peek_entry(&self, key: &str) -> Option<CacheEntry<T>> {
        self.inner.store.lock().entries.get(key).cloned()
    }

    /// Current state of `key`, without side effects
    pub fn get_state(&self, key: &str) -> Option<QueryState<T>> {
        self.inner
            .store
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.state.clone())
    }

    /// Current data of `key`, without side effects
    pub fn get_data(&self, key: &str) -> Option<T> {
        self.inner
            .store
            .lock()
            .entries
            .get(key)
            .and_then(|entry| entry.state.data().cloned())
    }

    /// Register a listener called after every state change of `key`
    ///
    /// Subscribing cancels a pending eviction of the key.
    pub fn subscribe(&self, key: &str, listener: Listener) -> Subscription {
        let id = {
            let mut store = self.inner.store.lock();
            let id = store.subscribers.add(key, listener);
            if store.gc.disarm(key) {
                debug!("Cancelled pending eviction: {}", key);
            }
            id
        };

        let weak = Arc::downgrade(&self.inner);
        let owned_key = key.to_string();
        Subscription::new(
            key.to_string(),
            id,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    QueryCache { inner }.unsubscribe(&owned_key, id);
                }
            }),
        )
    }

    /// Remove a listener; the last one out arms the eviction timer
    pub fn unsubscribe(&self, key: &str, id: SubscriptionId) -> bool {
        let mut guard = self.inner.store.lock();
        let store = &mut *guard;
        let Some((listener, remaining)) = store.subscribers.remove(key, id) else {
            return false;
        };

        if remaining == 0 {
            let delay = self.inner.config.gc_time_with_jitter();
            let weak = Arc::downgrade(&self.inner);
            let owned_key = key.to_string();
            let armed = store.gc.arm(key, move |timer_id| async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    QueryCache { inner }.collect(&owned_key, timer_id);
                }
            });
            if armed {
                debug!("Scheduled eviction of {} in {:?}", key, delay);
            }
        }
        drop(guard);

        // A listener may own subscriptions whose release locks the store
        drop(listener);
        true
    }

    /// Remove one entry with its in-flight fetch and eviction timer
    pub fn remove_query(&self, key: &str) -> bool {
        let removed = {
            let mut store = self.inner.store.lock();
            let removed = store.entries.remove(key).is_some();
            store.in_flight.remove(key);
            store.gc.disarm(key);
            removed
        };

        if removed {
            debug!("Removed query: {}", key);
            self.emit(CacheEvent::removed(key, RemovalReason::Removed));
            self.notify(key);
        }
        removed
    }

    /// Clear all entries from the cache
    ///
    /// Subscriptions survive and are notified.
    pub fn clear(&self) {
        let (keys, watched) = {
            let mut store = self.inner.store.lock();
            let keys: Vec<CacheKey> = store.entries.drain().map(|(key, _)| key).collect();
            store.in_flight.clear();
            store.gc.disarm_all();
            (keys, store.subscribers.keys())
        };

        info!("Cleared {} entries from query cache", keys.len());
        for key in &keys {
            self.emit(CacheEvent::removed(key, RemovalReason::Cleared));
        }
        for key in &watched {
            self.notify(key);
        }
    }

    /// Keys of all cached entries
    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.store.lock().entries.keys().cloned().collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.store.lock().entries.contains_key(key)
    }

    /// Get number of entries in cache
    pub fn len(&self) -> usize {
        self.inner.store.lock().entries.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.store.lock().entries.is_empty()
    }

    /// Whether a fetch is registered in flight for `key`
    pub fn is_fetching(&self, key: &str) -> bool {
        self.inner.store.lock().in_flight.contains(key)
    }

    /// Number of fetches in flight across all keys
    pub fn in_flight_count(&self) -> usize {
        self.inner.store.lock().in_flight.len()
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner.store.lock().subscribers.count(key)
    }

    /// Whether an eviction timer is armed for `key`
    pub fn has_pending_gc(&self, key: &str) -> bool {
        self.inner.store.lock().gc.is_pending(key)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let store = self.inner.store.lock();
        let mut stats = store.stats.clone();
        stats.entries = store.entries.len();
        stats
    }

    /// Receive cache-wide lifecycle events from now on
    pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Internal: idle/missing -> loading -> first-success | success | error
    fn direct_fetch(&self, key: &str, query_fn: QueryFn<T>, initial_data: Option<T>) -> Completion {
        let mut guard = self.inner.store.lock();
        let store = &mut *guard;

        if let Some(fetch) = store.in_flight.get(key) {
            let completion = fetch.join();
            store.stats.deduplicated += 1;
            debug!("Joining in-flight fetch: {}", key);
            return completion;
        }

        let is_new = !store.entries.contains_key(key);
        let entry = store
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry::new(None));

        if matches!(entry.state, QueryState::Loading { .. }) {
            trace!("Query already loading: {}", key);
            return ready_ok();
        }
        entry.query_fn = Some(Arc::clone(&query_fn));

        if let Some(data) = initial_data {
            if entry.state.data().is_none() {
                entry.seed(data);
                drop(guard);

                debug!("Seeded query with initial data: {}", key);
                if is_new {
                    self.emit(CacheEvent::new(CacheEventKind::Added, key));
                }
                self.emit(CacheEvent::updated(key, QueryStatus::FirstSuccess));
                self.notify(key);
                return ready_ok();
            }
        }

        entry.state = QueryState::Loading {
            updated_at: UpdatedAt::now(),
        };
        let generation = store.in_flight.next_generation();
        let completion = self.run_fetch(key, generation, FetchKind::Direct, query_fn);
        store.in_flight.register(
            key.to_string(),
            InFlight::new(generation, FetchKind::Direct, completion.clone()),
        );
        store.stats.fetches += 1;
        drop(guard);

        debug!("Starting direct fetch: {}", key);
        if is_new {
            self.emit(CacheEvent::new(CacheEventKind::Added, key));
        }
        self.emit(CacheEvent::updated(key, QueryStatus::Loading));
        self.notify(key);

        self.drive(key, completion.clone());
        completion.boxed()
    }

    /// Internal: success -> fetching -> success, when stale
    fn background_fetch(&self, key: &str) -> Completion {
        let mut guard = self.inner.store.lock();
        let store = &mut *guard;

        if let Some(fetch) = store.in_flight.get(key) {
            return fetch.join();
        }

        let Some(entry) = store.entries.get_mut(key) else {
            return ready_ok();
        };
        let Some(query_fn) = entry.query_fn.clone() else {
            trace!("No fetch function to revalidate with: {}", key);
            return ready_ok();
        };

        let (is_first, updated_at) = match &entry.state {
            QueryState::FirstSuccess { updated_at, .. } => (true, *updated_at),
            QueryState::Success { updated_at, .. } => (false, *updated_at),
            _ => return ready_ok(),
        };

        let now = Instant::now();
        if !updated_at.is_stale(self.inner.config.stale_time, now) {
            trace!("Query still fresh: {}", key);
            return ready_ok();
        }
        // Right after the first population a notify-then-read cycle would
        // otherwise refetch immediately
        if is_first && updated_at.is_within(self.inner.config.first_success_buffer, now) {
            trace!("Within first-success buffer, skipping revalidation: {}", key);
            return ready_ok();
        }

        entry.state = match std::mem::take(&mut entry.state) {
            QueryState::FirstSuccess { data, updated_at }
            | QueryState::Success { data, updated_at } => QueryState::Fetching { data, updated_at },
            other => other,
        };

        let generation = store.in_flight.next_generation();
        let completion = self.run_fetch(key, generation, FetchKind::Background, query_fn);
        store.in_flight.register(
            key.to_string(),
            InFlight::new(generation, FetchKind::Background, completion.clone()),
        );
        store.stats.background_fetches += 1;
        drop(guard);

        debug!("Revalidating in background: {}", key);
        self.emit(CacheEvent::updated(key, QueryStatus::Fetching));
        self.notify(key);

        self.drive(key, completion.clone());
        completion.boxed()
    }

    /// Internal: build the shared future that runs `query_fn` and writes back
    fn run_fetch(
        &self,
        key: &str,
        generation: u64,
        kind: FetchKind,
        query_fn: QueryFn<T>,
    ) -> SharedCompletion {
        let weak = Arc::downgrade(&self.inner);
        let key = key.to_string();

        let fetch = async move {
            let outcome = match AssertUnwindSafe(async move { query_fn().await })
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => Err(QueryError::from_panic(panic)),
            };

            let Some(inner) = weak.upgrade() else {
                return Err(CacheError::Cancelled { key });
            };
            let cache = QueryCache { inner };
            match kind {
                FetchKind::Direct => cache.settle_direct(&key, generation, outcome),
                FetchKind::Background => cache.settle_background(&key, generation, outcome),
            }
        };

        let completion: Completion = fetch.boxed();
        completion.shared()
    }

    /// Internal: force `key` stale and tell its watchers
    fn mark_invalidated(&self, key: &str) -> bool {
        {
            let mut guard = self.inner.store.lock();
            let store = &mut *guard;
            let Some(entry) = store.entries.get_mut(key) else {
                return false;
            };
            entry.force_stale();
            store.stats.invalidations += 1;
        }

        debug!("Invalidated query: {}", key);
        self.emit(CacheEvent::new(CacheEventKind::Invalidated, key));
        self.notify(key);
        true
    }

    /// Internal: revalidate when nobody will await the completion
    ///
    /// Only a spawned task can carry such a fetch to completion, so without a
    /// runtime the entry keeps its current state.
    fn revalidate_detached(&self, key: &str) {
        if tokio::runtime::Handle::try_current().is_err() {
            trace!("No Tokio runtime, skipping revalidation: {}", key);
            return;
        }
        // Driven by its own task
        drop(self.background_fetch(key));
    }

    /// Internal: run the fetch to completion even if no caller awaits it
    fn drive(&self, key: &str, completion: SharedCompletion) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(completion);
            }
            Err(_) => {
                warn!("No Tokio runtime, fetch for {} only progresses while awaited", key);
            }
        }
    }

    /// Internal: apply the outcome of a direct fetch
    fn settle_direct(
        &self,
        key: &str,
        generation: u64,
        outcome: std::result::Result<T, QueryError>,
    ) -> Result<()> {
        let mut guard = self.inner.store.lock();
        let store = &mut *guard;

        if !store.in_flight.is_current(key, generation) {
            debug!("Discarding result of cancelled fetch: {}", key);
            return Err(CacheError::Cancelled {
                key: key.to_string(),
            });
        }
        store.in_flight.remove(key);

        let Some(entry) = store.entries.get_mut(key) else {
            return Err(CacheError::Cancelled {
                key: key.to_string(),
            });
        };

        let result = match outcome {
            Ok(data) => {
                entry.record_data(data, true);
                Ok(())
            }
            Err(error) => {
                entry.state = QueryState::Error {
                    error: error.clone(),
                    updated_at: UpdatedAt::ForceStale,
                };
                store.stats.fetch_errors += 1;
                Err(CacheError::Fetch {
                    key: key.to_string(),
                    error,
                })
            }
        };
        let status = entry.state.status();
        drop(guard);

        match &result {
            Ok(()) => debug!("Fetch succeeded ({}): {}", status, key),
            Err(e) => warn!("{}", e),
        }
        self.emit(CacheEvent::updated(key, status));
        self.notify(key);
        result
    }

    /// Internal: apply the outcome of a background fetch; failures are absorbed
    fn settle_background(
        &self,
        key: &str,
        generation: u64,
        outcome: std::result::Result<T, QueryError>,
    ) -> Result<()> {
        let mut guard = self.inner.store.lock();
        let store = &mut *guard;

        if !store.in_flight.is_current(key, generation) {
            debug!("Discarding result of cancelled revalidation: {}", key);
            return Ok(());
        }
        store.in_flight.remove(key);

        let Some(entry) = store.entries.get_mut(key) else {
            return Ok(());
        };

        match outcome {
            Ok(data) => entry.record_data(data, false),
            Err(error) => {
                store.stats.background_errors += 1;
                warn!(
                    "Background revalidation failed, keeping previous data for {}: {}",
                    key, error
                );
                entry.state = match std::mem::take(&mut entry.state) {
                    QueryState::Fetching { data, updated_at } => {
                        QueryState::Success { data, updated_at }
                    }
                    other => other,
                };
            }
        }
        let status = entry.state.status();
        drop(guard);

        self.emit(CacheEvent::updated(key, status));
        self.notify(key);
        Ok(())
    }

    /// Internal: eviction timer fired
    fn collect(&self, key: &str, timer_id: u64) {
        let removed = {
            let mut store = self.inner.store.lock();
            if !store.gc.is_armed(key, timer_id) {
                trace!("Stale eviction timer ignored: {}", key);
                return;
            }
            store.gc.complete(key);

            if store.subscribers.count(key) > 0 {
                debug!("Skipping eviction of watched query: {}", key);
                return;
            }

            let removed = store.entries.remove(key).is_some();
            store.in_flight.remove(key);
            store.subscribers.remove_key(key);
            if removed {
                store.stats.gc_evictions += 1;
            }
            removed
        };

        if removed {
            debug!("Evicted unused query: {}", key);
            self.emit(CacheEvent::removed(key, RemovalReason::Collected));
        }
    }

    /// Internal: call the listeners of `key` outside the store lock
    fn notify(&self, key: &str) {
        let listeners = self.inner.store.lock().subscribers.snapshot(key);
        for listener in listeners {
            listener();
        }
    }

    fn emit(&self, event: CacheEvent) {
        // No receivers is not an error
        let _ = self.inner.events.send(event);
    }
}

fn ready_ok() -> Completion {
    future::ready(Ok(())).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::types::query_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fetch function returning how many times it has been called
    fn counting_fn(calls: &Arc<AtomicUsize>, delay: Duration) -> QueryFn<usize> {
        let calls = Arc::clone(calls);
        query_fn(move || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(delay).await;
                Ok::<_, anyhow::Error>(n)
            }
        })
    }

    fn record_statuses(
        cache: &QueryCache<usize>,
        key: &str,
    ) -> (Subscription, Arc<Mutex<Vec<QueryStatus>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reader = cache.clone();
        let owned_key = key.to_string();
        let subscription = cache.subscribe(
            key,
            Arc::new(move || {
                if let Some(state) = reader.get_state(&owned_key) {
                    sink.lock().push(state.status());
                }
            }),
        );
        (subscription, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_fetch_transitions() {
        let cache = QueryCache::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));
        let (_sub, seen) = record_statuses(&cache, "k");

        cache
            .fetch_query("k", counting_fn(&calls, Duration::from_millis(10)), None)
            .await
            .unwrap();

        assert_eq!(
            *seen.lock(),
            vec![QueryStatus::Loading, QueryStatus::FirstSuccess]
        );
        assert_eq!(cache.get_data("k"), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_deduplicate() {
        let cache = QueryCache::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));

        let completions: Vec<_> = (0..5)
            .map(|_| cache.fetch_query("k", counting_fn(&calls, Duration::from_millis(50)), None))
            .collect();
        assert!(cache.is_fetching("k"));

        for result in future::join_all(completions).await {
            assert!(result.is_ok());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get_data("k"), Some(1));
        assert_eq!(cache.stats().deduplicated, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_fetch_keeps_previous_data() {
        let cache = QueryCache::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fn(&calls, Duration::from_millis(10));

        cache.fetch_query("k", fetch.clone(), None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let (_sub, seen) = record_statuses(&cache, "k");
        let completion = cache.fetch_query("k", fetch, None);

        let state = cache.get_state("k").unwrap();
        assert_eq!(state.status(), QueryStatus::Fetching);
        assert_eq!(state.data(), Some(&1));

        completion.await.unwrap();
        assert_eq!(
            *seen.lock(),
            vec![QueryStatus::Fetching, QueryStatus::Success]
        );
        assert_eq!(cache.get_data("k"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_failure_restores_previous_state() {
        let cache: QueryCache<usize> = QueryCache::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let flaky = query_fn(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    Ok(10)
                } else {
                    Err(anyhow::anyhow!("offline"))
                }
            }
        });

        cache.fetch_query("k", flaky.clone(), None).await.unwrap();
        let before = cache.get_state("k").unwrap().updated_at();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(cache.fetch_query("k", flaky, None).await.is_ok());

        let state = cache.get_state("k").unwrap();
        assert_eq!(state.status(), QueryStatus::Success);
        assert_eq!(state.data(), Some(&10));
        assert_eq!(state.updated_at(), before);
        assert_eq!(cache.stats().background_errors, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_buffer_skips_refetch() {
        let cache = QueryCache::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fn(&calls, Duration::ZERO);

        cache.fetch_query("k", fetch.clone(), None).await.unwrap();
        cache.fetch_query("k", fetch.clone(), None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get_state("k").unwrap().status(), QueryStatus::FirstSuccess);

        tokio::time::sleep(Duration::from_millis(400)).await;
        cache.fetch_query("k", fetch, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get_state("k").unwrap().status(), QueryStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_data_is_not_refetched() {
        let config = QueryCacheConfig::builder()
            .stale_time(Duration::from_secs(60))
            .build()
            .unwrap();
        let cache = QueryCache::new(config);
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fn(&calls, Duration::ZERO);

        cache.fetch_query("k", fetch.clone(), None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        cache.fetch_query("k", fetch.clone(), None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        cache.fetch_query("k", fetch, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_initial_data_skips_fetch() {
        let cache = QueryCache::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .fetch_query("k", counting_fn(&calls, Duration::ZERO), Some(42))
            .await
            .unwrap();

        let state = cache.get_state("k").unwrap();
        assert_eq!(state.status(), QueryStatus::FirstSuccess);
        assert_eq!(state.data(), Some(&42));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_direct_fetch_error_then_retry() {
        let cache: QueryCache<usize> = QueryCache::with_defaults();
        let failing = query_fn(|| async { Err::<usize, _>(anyhow::anyhow!("boom")) });

        let err = cache.fetch_query("k", failing, None).await.unwrap_err();
        assert!(matches!(err, CacheError::Fetch { .. }));

        let state = cache.get_state("k").unwrap();
        assert_eq!(state.status(), QueryStatus::Error);
        assert_eq!(state.error().map(|e| e.message()), Some("boom"));
        assert_eq!(state.updated_at(), UpdatedAt::ForceStale);
        assert_eq!(state.data(), None);

        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .fetch_query("k", counting_fn(&calls, Duration::ZERO), None)
            .await
            .unwrap();
        assert_eq!(cache.get_state("k").unwrap().status(), QueryStatus::FirstSuccess);
        assert_eq!(cache.stats().fetch_errors, 1);
    }

    #[tokio::test]
    async fn test_refetch_requires_query_fn() {
        let cache = QueryCache::with_defaults();
        cache.set_data("k", 1_usize);

        let err = cache.refetch_query("k").await.unwrap_err();
        assert!(matches!(err, CacheError::MissingQueryFn { .. }));

        let err = cache.refetch_query("missing").await.unwrap_err();
        assert!(matches!(err, CacheError::MissingQueryFn { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_is_direct_even_when_fresh() {
        let config = QueryCacheConfig::builder()
            .stale_time(Duration::from_secs(3600))
            .build()
            .unwrap();
        let cache = QueryCache::new(config);
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .fetch_query("k", counting_fn(&calls, Duration::from_millis(5)), None)
            .await
            .unwrap();
        let (_sub, seen) = record_statuses(&cache, "k");

        cache.refetch_query("k").await.unwrap();
        assert_eq!(*seen.lock(), vec![QueryStatus::Loading, QueryStatus::Success]);
        assert_eq!(cache.get_data("k"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_triggers_revalidation() {
        let cache = QueryCache::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .fetch_query("k", counting_fn(&calls, Duration::from_millis(5)), None)
            .await
            .unwrap();
        let (_sub, seen) = record_statuses(&cache, "k");

        cache.invalidate_query("k").await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                QueryStatus::FirstSuccess,
                QueryStatus::Fetching,
                QueryStatus::Success
            ]
        );
        assert_eq!(cache.get_data("k"), Some(2));
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[tokio::test]
    async fn test_invalidate_without_query_fn_only_marks_stale() {
        let cache = QueryCache::with_defaults();
        cache.set_data("k", 3_usize);

        cache.invalidate_query("k").await.unwrap();

        let state = cache.get_state("k").unwrap();
        assert_eq!(state.status(), QueryStatus::Success);
        assert_eq!(state.updated_at(), UpdatedAt::ForceStale);
        assert!(!cache.is_fetching("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_late_result() {
        let cache: QueryCache<usize> = QueryCache::with_defaults();
        let slow = query_fn(|| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, anyhow::Error>(100)
        });
        let fast = query_fn(|| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, anyhow::Error>(7)
        });

        let abandoned = cache.fetch_query("k", slow, None);
        assert!(cache.cancel_query("k"));
        assert_eq!(cache.get_state("k").unwrap().status(), QueryStatus::Idle);

        cache.fetch_query("k", fast, None).await.unwrap();
        let err = abandoned.await.unwrap_err();
        assert!(err.is_cancelled());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.get_data("k"), Some(7));
        assert_eq!(cache.stats().cancellations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_background_fetch_keeps_data() {
        let cache = QueryCache::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fn(&calls, Duration::from_millis(50));

        cache.fetch_query("k", fetch.clone(), None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let completion = cache.fetch_query("k", fetch, None);
        assert!(cache.cancel_query("k"));

        let state = cache.get_state("k").unwrap();
        assert_eq!(state.status(), QueryStatus::Idle);
        assert_eq!(state.data(), Some(&1));

        assert!(completion.await.is_ok());
        assert_eq!(cache.get_data("k"), Some(1));
    }

    #[tokio::test]
    async fn test_cancel_without_fetch_is_noop() {
        let cache = QueryCache::with_defaults();
        cache.set_data("k", 1_usize);
        assert!(!cache.cancel_query("k"));
        assert_eq!(cache.get_state("k").unwrap().status(), QueryStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_entry_revalidates_stale_data() {
        let cache = QueryCache::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .fetch_query("k", counting_fn(&calls, Duration::from_millis(10)), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let peeked = cache.peek_entry("k").unwrap();
        assert_eq!(peeked.state.status(), QueryStatus::FirstSuccess);
        assert!(!cache.is_fetching("k"));

        let entry = cache.get_entry("k").unwrap();
        assert_eq!(entry.state.status(), QueryStatus::Fetching);
        assert_eq!(entry.state.data(), Some(&1));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get_data("k"), Some(2));
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_evicts_unwatched_entries() {
        let config = QueryCacheConfig::builder()
            .gc_time(Duration::from_secs(10))
            .build()
            .unwrap();
        let cache = QueryCache::new(config);
        cache.set_data("k", 1_usize);

        let sub = cache.subscribe("k", Arc::new(|| {}));
        assert!(!cache.has_pending_gc("k"));
        sub.unsubscribe();
        assert!(cache.has_pending_gc("k"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let sub = cache.subscribe("k", Arc::new(|| {}));
        assert!(!cache.has_pending_gc("k"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(cache.get_data("k"), Some(1));

        drop(sub);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!cache.contains_key("k"));
        assert!(!cache.has_pending_gc("k"));
        assert_eq!(cache.subscriber_count("k"), 0);
        assert_eq!(cache.stats().gc_evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_with_unbounded_gc_time() {
        let config = QueryCacheConfig {
            gc_time: Duration::MAX,
            gc_jitter: 0.10,
            ..QueryCacheConfig::static_content()
        };
        let cache = QueryCache::new(config);
        cache.set_data("k", 1_usize);

        for _ in 0..20 {
            cache.subscribe("k", Arc::new(|| {})).unsubscribe();
            assert!(cache.has_pending_gc("k"));
        }

        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(cache.get_data("k"), Some(1));
    }

    #[test]
    fn test_detached_revalidation_skipped_without_runtime() {
        let config = QueryCacheConfig::builder()
            .first_success_buffer(Duration::ZERO)
            .build()
            .unwrap();
        let cache = QueryCache::new(config);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetch = query_fn(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok::<_, anyhow::Error>(n) }
        });

        futures::executor::block_on(cache.fetch_query("k", fetch.clone(), None)).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let entry = cache.get_entry("k").unwrap();
        assert_eq!(entry.state.status(), QueryStatus::FirstSuccess);
        assert!(!cache.is_fetching("k"));

        cache.invalidate_query_detached("k");
        let state = cache.get_state("k").unwrap();
        assert_eq!(state.status(), QueryStatus::FirstSuccess);
        assert_eq!(state.updated_at(), UpdatedAt::ForceStale);
        assert!(!cache.is_fetching("k"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // An awaited fetch still revalidates
        futures::executor::block_on(cache.fetch_query("k", fetch, None)).unwrap();
        assert_eq!(cache.get_state("k").unwrap().status(), QueryStatus::Success);
        assert_eq!(cache.get_data("k"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_reentrancy() {
        let cache = QueryCache::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fn(&calls, Duration::from_millis(10));

        let reader = cache.clone();
        let refetch = fetch.clone();
        let _sub = cache.subscribe(
            "k",
            Arc::new(move || {
                let _ = reader.get_entry("k");
                drop(reader.fetch_query("k", refetch.clone(), None));
            }),
        );

        cache.fetch_query("k", fetch, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get_state("k").unwrap().status(), QueryStatus::FirstSuccess);
    }

    #[tokio::test]
    async fn test_listener_releasing_its_own_subscription() {
        let cache = QueryCache::with_defaults();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let own = Arc::clone(&slot);

        let subscription = cache.subscribe(
            "k",
            Arc::new(move || {
                let taken = own.lock().take();
                drop(taken);
            }),
        );
        *slot.lock() = Some(subscription);

        cache.set_data("k", 1_usize);
        assert_eq!(cache.subscriber_count("k"), 0);
        assert!(cache.has_pending_gc("k"));
    }

    #[tokio::test]
    async fn test_query_fn_panic_is_coerced() {
        let cache: QueryCache<usize> = QueryCache::with_defaults();
        let exploding = query_fn(|| async {
            let explode = true;
            if explode {
                panic!("kaboom");
            }
            Ok::<usize, anyhow::Error>(0)
        });

        let err = cache.fetch_query("k", exploding, None).await.unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        assert!(!cache.is_fetching("k"));
        assert_eq!(cache.get_state("k").unwrap().status(), QueryStatus::Error);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let cache = QueryCache::with_defaults();
        cache.set_data("a", 1_usize);
        cache.set_data("b", 2_usize);
        cache.set_data("c", 3_usize);

        assert!(cache.remove_query("a"));
        assert!(!cache.remove_query("a"));
        assert_eq!(cache.len(), 2);

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let _sub = cache.subscribe(
            "b",
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(cache.subscriber_count("b"), 1);
    }

    #[tokio::test]
    async fn test_events_stream() {
        let cache = QueryCache::with_defaults();
        let mut events = cache.events();

        cache.set_data("k", 1_usize);
        cache.invalidate_query("k").await.unwrap();
        cache.remove_query("k");

        let kinds: Vec<CacheEventKind> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|event| event.kind)
            .collect();

        assert_eq!(
            kinds,
            vec![
                CacheEventKind::Added,
                CacheEventKind::Updated {
                    status: QueryStatus::Success
                },
                CacheEventKind::Invalidated,
                CacheEventKind::Removed {
                    reason: RemovalReason::Removed
                },
            ]
        );
    }
}
