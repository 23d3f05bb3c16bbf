//! # Query Cache
//!
//! Keyed store of asynchronously fetched values, kept fresh with a
//! stale-while-revalidate policy.
//!
//! ## Features
//!
//! - **Request Deduplication**: Concurrent fetches for one key share a single call
//! - **Background Revalidation**: Stale data stays visible while it is refreshed
//! - **First-Success Buffer**: No refetch storm right after the first population
//! - **Cancellation**: Late results of abandoned fetches are discarded
//! - **Subscriptions**: Synchronous per-key change listeners
//! - **Garbage Collection**: Unwatched entries are evicted after a grace period
//!
//! ## Lifecycle
//!
//! ```text
//! idle ──> loading ──> first-success ──> fetching ──> success
//!              │                             │
//!              └──> error              (failure restores success)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use ouroboros_query::cache::{query_fn, QueryCache, QueryCacheConfig, QueryKey};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = QueryCacheConfig::builder()
//!     .stale_time(Duration::from_secs(30))
//!     .gc_time(Duration::from_secs(600))
//!     .build()?;
//!
//! let cache: QueryCache<String> = QueryCache::new(config);
//! let key = QueryKey::from("greeting").hash();
//!
//! cache
//!     .fetch_query(&key, query_fn(|| async { Ok::<_, anyhow::Error>("hello".to_string()) }), None)
//!     .await?;
//!
//! if let Some(value) = cache.get_data(&key) {
//!     println!("Cache hit: {}", value);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod events;
pub(crate) mod gc;
pub(crate) mod in_flight;
pub mod key;
pub mod state;
pub mod store;
pub mod subscribers;
pub mod types;

pub use config::{QueryCacheConfig, QueryCacheConfigBuilder};
pub use entry::CacheEntry;
pub use events::{CacheEvent, CacheEventKind, RemovalReason};
pub use key::{canonicalize, QueryKey};
pub use state::{QueryState, QueryStatus, UpdatedAt};
pub use store::QueryCache;
pub use subscribers::{Listener, Subscription, SubscriptionId};
pub use types::{query_fn, CacheKey, CacheStats, Completion, QueryFn};
