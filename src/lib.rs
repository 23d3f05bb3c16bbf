//! # Ouroboros Query (ouroboros-query)
//!
//! An in-memory, asynchronous data-fetching cache for Rust.
//!
//! ## Features
//!
//! - Structural query keys (`["todo", {"id": 1}]`) canonicalized to stable strings
//! - At most one fetch in flight per key; concurrent callers share the result
//! - Stale-while-revalidate: cached data is served while a background fetch refreshes it
//! - Manual invalidation and cancellation
//! - Per-key subscriptions and cache-wide lifecycle events
//! - Garbage collection of entries nobody watches
//! - Optimistic mutations with deterministic rollback
//!
//! ## Fetching
//!
//! ```no_run
//! use ouroboros_query::{query_key, FetchQueryOptions, QueryClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client: QueryClient<Vec<String>> = QueryClient::with_defaults();
//!
//!     client
//!         .fetch_query(FetchQueryOptions::new(query_key!["todos"], || async {
//!             Ok::<_, anyhow::Error>(vec!["write docs".to_string()])
//!         }))
//!         .await?;
//!
//!     println!("Todos: {:?}", client.get_query_data(&query_key!["todos"]));
//!     Ok(())
//! }
//! ```
//!
//! ## Optimistic Updates
//!
//! `on_mutate` writes the optimistic value and returns the previous one as
//! context; `on_error` puts it back; `on_settled` revalidates.
//!
//! ```no_run
//! use ouroboros_query::{query_key, Mutation, MutationOptions, QueryClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client: QueryClient<Vec<String>> = QueryClient::with_defaults();
//!     let key = query_key!["todos"];
//!
//!     let (optimistic, rollback, settle) = (client.clone(), client.clone(), client.clone());
//!     let (k1, k2, k3) = (key.clone(), key.clone(), key.clone());
//!
//!     let add_todo = Mutation::new(
//!         MutationOptions::builder()
//!             .mutation_fn(|title: String| async move {
//!                 Ok::<_, anyhow::Error>(title)
//!             })
//!             .on_mutate(move |title: &String| {
//!                 optimistic.cancel_queries(&k1);
//!                 let previous = optimistic.get_query_data(&k1);
//!                 optimistic.update_query_data(&k1, |todos| {
//!                     let mut todos = todos.cloned().unwrap_or_default();
//!                     todos.push(title.clone());
//!                     todos
//!                 });
//!                 previous
//!             })
//!             .on_error(move |_err, _title, previous: Option<&Option<Vec<String>>>| {
//!                 if let Some(Some(previous)) = previous {
//!                     rollback.set_query_data(&k2, previous.clone());
//!                 }
//!             })
//!             .on_settled(move |_, _, _, _| settle.invalidate_queries(&k3))
//!             .build()?,
//!     );
//!
//!     add_todo.mutate("buy milk".to_string()).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod error;
pub mod mutation;

// Re-export main types for convenience
pub use cache::{
    query_fn, CacheEntry, CacheEvent, CacheEventKind, CacheKey, CacheStats, QueryCache,
    QueryCacheConfig, QueryCacheConfigBuilder, QueryFn, QueryKey, QueryState, QueryStatus,
    RemovalReason, Subscription, UpdatedAt,
};
pub use client::{FetchQueryOptions, QueryClient};
pub use error::{CacheError, QueryError, Result};
pub use mutation::{
    Mutation, MutationId, MutationOptions, MutationOptionsBuilder, MutationState, MutationStatus,
};

#[doc(hidden)]
pub use serde_json as __serde_json;
