//! Core type definitions for the query cache

use crate::error::QueryError;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Canonical cache key, as produced by [`QueryKey::hash`](crate::cache::QueryKey::hash)
pub type CacheKey = String;

/// Type-erased fetch function stored alongside a cache entry
pub type QueryFn<T> =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<T, QueryError>> + Send + Sync>;

/// Completion signal returned by fetch operations
pub type Completion = BoxFuture<'static, crate::error::Result<()>>;

/// Cloneable completion shared by every caller joining one in-flight fetch
pub(crate) type SharedCompletion = Shared<Completion>;

/// Wrap an async closure into a [`QueryFn`]
///
/// The closure may fail with any error convertible into `anyhow::Error`;
/// the error is coerced into a [`QueryError`].
pub fn query_fn<T, F, Fut, E>(f: F) -> QueryFn<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    E: Into<anyhow::Error> + 'static,
    T: 'static,
{
    Arc::new(move || {
        let fut = f();
        async move { fut.await.map_err(QueryError::coerce) }.boxed()
    })
}

/// Statistics for cache activity
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CacheStats {
    /// Reads through the primary read path that found data
    pub hits: u64,

    /// Reads through the primary read path that found nothing
    pub misses: u64,

    /// Direct fetches started
    pub fetches: u64,

    /// Background revalidations started
    pub background_fetches: u64,

    /// Fetch requests that joined an in-flight fetch instead of starting one
    pub deduplicated: u64,

    /// Direct fetches that failed
    pub fetch_errors: u64,

    /// Background revalidations that failed and were absorbed
    pub background_errors: u64,

    /// In-flight fetches cancelled
    pub cancellations: u64,

    /// Explicit invalidations
    pub invalidations: u64,

    /// Entries evicted by the GC scheduler
    pub gc_evictions: u64,

    /// Number of entries currently in cache
    pub entries: usize,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }

    /// Total fetches started, direct and background
    pub fn total_fetches(&self) -> u64 {
        self.fetches + self.background_fetches
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, entries: {}, fetches: {}, deduplicated: {}, errors: {}, gc_evictions: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.entries,
            self.total_fetches(),
            self.deduplicated,
            self.fetch_errors + self.background_errors,
            self.gc_evictions
        )
    }
}
