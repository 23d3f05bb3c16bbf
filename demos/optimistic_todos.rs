//! Optimistic Todos Demo
//!
//! Walks a todo list through the cache lifecycle: first load, background
//! revalidation, an optimistic add that succeeds, one that is rejected and
//! rolled back, and eviction once nobody watches the list.
//!
//! Usage:
//!   cargo run --example optimistic_todos
//!
//! Environment variables:
//!   RUST_LOG                    - log filter (default: info,ouroboros_query=debug)
//!   QUERY_CACHE_STALE_TIME_MS   - stale time (default: 0)
//!   QUERY_CACHE_GC_TIME_MS      - eviction grace period (demo default: 2000)

use ouroboros_query::{
    query_key, FetchQueryOptions, Mutation, MutationOptions, QueryCacheConfig, QueryClient,
    QueryKey,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

type Todos = Vec<String>;

/// Pretend remote API with latency
#[derive(Clone, Default)]
struct TodoApi {
    todos: Arc<Mutex<Todos>>,
}

impl TodoApi {
    async fn list(&self) -> anyhow::Result<Todos> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(self.todos.lock().clone())
    }

    async fn add(&self, title: String) -> anyhow::Result<String> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        if title.contains("forbidden") {
            anyhow::bail!("server rejected {:?}", title);
        }
        self.todos.lock().push(title.clone());
        Ok(title)
    }
}

fn list_query(api: &TodoApi) -> FetchQueryOptions<Todos> {
    let api = api.clone();
    FetchQueryOptions::new(query_key!["todos"], move || {
        let api = api.clone();
        async move { api.list().await }
    })
}

fn add_todo(
    client: &QueryClient<Todos>,
    api: &TodoApi,
) -> anyhow::Result<Mutation<String, String, Option<Todos>>> {
    let key: QueryKey = query_key!["todos"];
    let (optimistic, rollback, revalidate) = (client.clone(), client.clone(), client.clone());
    let (k1, k2, k3) = (key.clone(), key.clone(), key);
    let api = api.clone();

    let options = MutationOptions::builder()
        .mutation_fn(move |title: String| {
            let api = api.clone();
            async move { api.add(title).await }
        })
        .on_mutate(move |title: &String| {
            optimistic.cancel_queries(&k1);
            let previous = optimistic.get_query_data(&k1);
            optimistic.update_query_data(&k1, |todos| {
                let mut todos = todos.cloned().unwrap_or_default();
                todos.push(title.clone());
                todos
            });
            info!("Optimistically added {:?}", title);
            previous
        })
        .on_error(move |err, title, previous: Option<&Option<Todos>>| {
            info!("Rolling back {:?}: {}", title, err);
            if let Some(Some(previous)) = previous {
                rollback.set_query_data(&k2, previous.clone());
            }
        })
        .on_settled(move |_, _, _, _| revalidate.invalidate_queries(&k3))
        .build()?;

    Ok(Mutation::new(options))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ouroboros_query=debug")),
        )
        .init();

    info!("=== Optimistic Todos Demo ===");

    let mut config = QueryCacheConfig::from_env()?;
    if std::env::var("QUERY_CACHE_GC_TIME_MS").is_err() {
        config.gc_time = Duration::from_secs(2);
    }
    let client: QueryClient<Todos> = QueryClient::new(config);
    let api = TodoApi::default();
    api.todos.lock().push("read the docs".to_string());

    let key = query_key!["todos"];
    let watcher = client.clone();
    let watched = key.clone();
    let subscription = client.subscribe(&key, move || {
        if let Some(state) = watcher.get_query_state(&watched) {
            info!("todos -> {} {:?}", state.status(), state.data());
        }
    });

    info!("\n--- First load ---");
    client.fetch_query(list_query(&api)).await?;

    info!("\n--- Background revalidation ---");
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.fetch_query(list_query(&api)).await?;

    let mutation = add_todo(&client, &api)?;

    info!("\n--- Optimistic add (accepted) ---");
    mutation.mutate("write the demo".to_string()).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    info!("\n--- Optimistic add (rejected) ---");
    if let Err(e) = mutation.mutate("forbidden todo".to_string()).await {
        info!("Mutation failed as expected: {}", e);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    info!("Final todos: {:?}", client.get_query_data(&key));

    info!("\n--- Eviction ---");
    subscription.unsubscribe();
    tokio::time::sleep(client.cache().config().gc_time + Duration::from_millis(100)).await;
    info!("Entry still cached: {}", client.get_query_state(&key).is_some());

    info!("\n--- Statistics ---");
    info!("{}", client.stats());

    Ok(())
}
