//! Query client: the application-facing API over [`QueryCache`]
//!
//! The client speaks in [`QueryKey`]s and closures; the engine below it only
//! sees canonical string keys. One client is constructed per application and
//! cloned into whatever needs it.

use crate::cache::{
    query_fn, CacheEvent, CacheStats, QueryCache, QueryCacheConfig, QueryFn, QueryKey,
    QueryState, Subscription,
};
use crate::error::{CacheError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// What to fetch and how
pub struct FetchQueryOptions<T> {
    /// Structured identity of the query
    pub query_key: QueryKey,

    /// Function producing the data
    pub query_fn: QueryFn<T>,

    /// Data to seed an empty entry with instead of fetching
    pub initial_data: Option<T>,
}

impl<T: Send + 'static> FetchQueryOptions<T> {
    /// Create options from a key and an async closure
    pub fn new<F, Fut, E>(query_key: impl Into<QueryKey>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        Self::with_query_fn(query_key, query_fn(f))
    }

    /// Create options from an already wrapped fetch function
    pub fn with_query_fn(query_key: impl Into<QueryKey>, query_fn: QueryFn<T>) -> Self {
        Self {
            query_key: query_key.into(),
            query_fn,
            initial_data: None,
        }
    }

    /// Seed the entry with `data` when it holds none
    pub fn initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(data);
        self
    }
}

impl<T: Clone> Clone for FetchQueryOptions<T> {
    fn clone(&self) -> Self {
        Self {
            query_key: self.query_key.clone(),
            query_fn: Arc::clone(&self.query_fn),
            initial_data: self.initial_data.clone(),
        }
    }
}

/// Typed handle to a query cache
pub struct QueryClient<T> {
    cache: QueryCache<T>,
}

impl<T> Clone for QueryClient<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<T> QueryClient<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: QueryCacheConfig) -> Self {
        Self {
            cache: QueryCache::new(config),
        }
    }

    /// Create a client with default configuration
    pub fn with_defaults() -> Self {
        Self::new(QueryCacheConfig::default())
    }

    /// Create a client sharing an existing cache
    pub fn from_cache(cache: QueryCache<T>) -> Self {
        Self { cache }
    }

    /// The underlying engine
    pub fn cache(&self) -> &QueryCache<T> {
        &self.cache
    }

    /// Ensure the query holds fresh-or-cached data
    ///
    /// Resolves when the direct fetch (or background revalidation) this call
    /// started or joined has settled.
    pub async fn fetch_query(&self, options: FetchQueryOptions<T>) -> Result<()> {
        let key = options.query_key.hash();
        self.cache
            .fetch_query(&key, options.query_fn, options.initial_data)
            .await
    }

    /// Cached data if present, otherwise fetch it
    pub async fn ensure_query_data(&self, options: FetchQueryOptions<T>) -> Result<T> {
        let key = options.query_key.hash();
        if let Some(data) = self.cache.get_data(&key) {
            trace!("Query data already cached: {}", key);
            return Ok(data);
        }

        self.cache
            .fetch_query(&key, options.query_fn, options.initial_data)
            .await?;
        self.cache
            .get_data(&key)
            .ok_or(CacheError::Cancelled { key })
    }

    /// Fetch ahead of time; failures are logged and swallowed
    pub async fn prefetch_query(&self, options: FetchQueryOptions<T>) {
        let key = options.query_key.clone();
        if let Err(e) = self.fetch_query(options).await {
            warn!("Prefetch of {} failed: {}", key, e);
        }
    }

    /// Current data, without side effects
    pub fn get_query_data(&self, key: &QueryKey) -> Option<T> {
        self.cache.get_data(&key.hash())
    }

    /// Current state, revalidating in the background if stale
    pub fn read_query(&self, key: &QueryKey) -> Option<QueryState<T>> {
        self.cache.get_entry(&key.hash()).map(|entry| entry.state)
    }

    /// Current state, without side effects
    pub fn get_query_state(&self, key: &QueryKey) -> Option<QueryState<T>> {
        self.cache.get_state(&key.hash())
    }

    /// Overwrite the data for `key`
    pub fn set_query_data(&self, key: &QueryKey, data: T) {
        self.cache.set_data(&key.hash(), data);
    }

    /// Derive new data from the current data and store it
    ///
    /// The read and the write are two separate steps; a fetch settling in
    /// between is overwritten.
    pub fn update_query_data<F>(&self, key: &QueryKey, updater: F) -> T
    where
        F: FnOnce(Option<&T>) -> T,
    {
        let hash = key.hash();
        let current = self.cache.get_data(&hash);
        let next = updater(current.as_ref());
        self.cache.set_data(&hash, next.clone());
        next
    }

    /// Mark the query stale and revalidate it in the background
    pub fn invalidate_queries(&self, key: &QueryKey) {
        self.cache.invalidate_query_detached(&key.hash());
    }

    /// Invalidate every cached query whose key starts with `prefix`
    pub fn invalidate_queries_matching(&self, prefix: &QueryKey) -> usize {
        let mut invalidated = 0;
        for hash in self.cache.keys() {
            let key = match QueryKey::from_hash(&hash) {
                Ok(key) => key,
                Err(_) => {
                    trace!("Skipping non-structured key: {}", hash);
                    continue;
                }
            };
            if prefix.is_prefix_of(&key) {
                self.cache.invalidate_query_detached(&hash);
                invalidated += 1;
            }
        }

        debug!("Invalidated {} queries matching {}", invalidated, prefix);
        invalidated
    }

    /// Abandon the in-flight fetch for `key`
    pub fn cancel_queries(&self, key: &QueryKey) -> bool {
        self.cache.cancel_query(&key.hash())
    }

    /// Fetch again with the recorded fetch function
    pub async fn refetch_queries(&self, key: &QueryKey) -> Result<()> {
        self.cache.refetch_query(&key.hash()).await
    }

    pub fn remove_queries(&self, key: &QueryKey) -> bool {
        self.cache.remove_query(&key.hash())
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Call `listener` after every state change of `key`
    pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.cache.subscribe(&key.hash(), Arc::new(listener))
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
        self.cache.events()
    }
}
