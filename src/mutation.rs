//! Optimistic mutations
//!
//! A mutation runs a remote write with hooks around it:
//!
//! 1. `on_mutate` runs first and returns a context, typically the value it
//!    replaced with an optimistic one
//! 2. The status becomes `Loading` and the mutation function is awaited
//! 3. The terminal status (`Success` or `Error`) is set, then `on_success` or
//!    `on_error` runs; `on_error` is where a rollback belongs
//! 4. `on_settled` runs last, exactly once
//!
//! ```rust
//! use ouroboros_query::mutation::{Mutation, MutationOptions};
//!
//! # async fn example() -> ouroboros_query::Result<()> {
//! let options = MutationOptions::<u32, u32>::builder()
//!     .mutation_fn(|n: u32| async move { Ok::<_, anyhow::Error>(n * 2) })
//!     .on_success(|data, _vars, _ctx| println!("saved {}", data))
//!     .build()?;
//!
//! let mutation = Mutation::new(options);
//! assert_eq!(mutation.mutate(21).await?, 42);
//! # Ok(())
//! # }
//! ```

use crate::error::{CacheError, QueryError, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique identifier of a mutation
pub type MutationId = Uuid;

/// Remote write performed by a mutation
pub type MutationFn<V, D> =
    Arc<dyn Fn(V) -> BoxFuture<'static, std::result::Result<D, QueryError>> + Send + Sync>;

type OnMutate<V, C> = Arc<dyn Fn(&V) -> C + Send + Sync>;
type OnSuccess<V, D, C> = Arc<dyn Fn(&D, &V, Option<&C>) + Send + Sync>;
type OnError<V, C> = Arc<dyn Fn(&QueryError, &V, Option<&C>) + Send + Sync>;
type OnSettled<V, D, C> = Arc<dyn Fn(Option<&D>, Option<&QueryError>, &V, Option<&C>) + Send + Sync>;

/// Discriminant of [`MutationState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationStatus {
    Idle,
    Loading,
    Success,
    Error,
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationStatus::Idle => write!(f, "idle"),
            MutationStatus::Loading => write!(f, "loading"),
            MutationStatus::Success => write!(f, "success"),
            MutationStatus::Error => write!(f, "error"),
        }
    }
}

/// State of a mutation
#[derive(Debug, Clone, PartialEq)]
pub enum MutationState<D> {
    /// Not run yet, or reset
    Idle,

    /// Mutation function in progress
    Loading,

    /// Last run succeeded
    Success { data: D },

    /// Last run failed
    Error { error: QueryError },
}

impl<D> MutationState<D> {
    pub fn status(&self) -> MutationStatus {
        match self {
            MutationState::Idle => MutationStatus::Idle,
            MutationState::Loading => MutationStatus::Loading,
            MutationState::Success { .. } => MutationStatus::Success,
            MutationState::Error { .. } => MutationStatus::Error,
        }
    }

    pub fn data(&self) -> Option<&D> {
        match self {
            MutationState::Success { data } => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&QueryError> {
        match self {
            MutationState::Error { error } => Some(error),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, MutationState::Loading)
    }
}

/// Mutation function and lifecycle hooks
///
/// `V` is the variables type, `D` the data returned by the remote write and
/// `C` the context produced by `on_mutate`.
pub struct MutationOptions<V, D, C = ()> {
    mutation_fn: MutationFn<V, D>,
    on_mutate: Option<OnMutate<V, C>>,
    on_success: Option<OnSuccess<V, D, C>>,
    on_error: Option<OnError<V, C>>,
    on_settled: Option<OnSettled<V, D, C>>,
}

impl<V, D, C> MutationOptions<V, D, C> {
    /// Create a new builder
    pub fn builder() -> MutationOptionsBuilder<V, D, C> {
        MutationOptionsBuilder::default()
    }
}

impl<V, D, C> Clone for MutationOptions<V, D, C> {
    fn clone(&self) -> Self {
        Self {
            mutation_fn: Arc::clone(&self.mutation_fn),
            on_mutate: self.on_mutate.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

/// Builder for MutationOptions
pub struct MutationOptionsBuilder<V, D, C = ()> {
    mutation_fn: Option<MutationFn<V, D>>,
    on_mutate: Option<OnMutate<V, C>>,
    on_success: Option<OnSuccess<V, D, C>>,
    on_error: Option<OnError<V, C>>,
    on_settled: Option<OnSettled<V, D, C>>,
}

impl<V, D, C> Default for MutationOptionsBuilder<V, D, C> {
    fn default() -> Self {
        Self {
            mutation_fn: None,
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<V, D, C> MutationOptionsBuilder<V, D, C> {
    /// Set the remote write; any error convertible to `anyhow::Error` is accepted
    pub fn mutation_fn<F, Fut, E>(mut self, f: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<D, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
        V: 'static,
        D: 'static,
        C: 'static,
    {
        self.mutation_fn = Some(Arc::new(move |variables| {
            f(variables).map(|result| result.map_err(QueryError::coerce)).boxed()
        }));
        self
    }

    /// Set the hook run before the remote write
    pub fn on_mutate<F>(mut self, f: F) -> Self
    where
        F: Fn(&V) -> C + Send + Sync + 'static,
    {
        self.on_mutate = Some(Arc::new(f));
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&D, &V, Option<&C>) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueryError, &V, Option<&C>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_settled<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&D>, Option<&QueryError>, &V, Option<&C>) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }

    /// Build the options; a mutation function is required
    pub fn build(self) -> Result<MutationOptions<V, D, C>> {
        let mutation_fn = self
            .mutation_fn
            .ok_or_else(|| CacheError::ConfigError("mutation_fn is required".to_string()))?;

        Ok(MutationOptions {
            mutation_fn,
            on_mutate: self.on_mutate,
            on_success: self.on_success,
            on_error: self.on_error,
            on_settled: self.on_settled,
        })
    }
}

/// A reusable mutation with observable state
pub struct Mutation<V, D, C = ()> {
    id: MutationId,
    options: MutationOptions<V, D, C>,
    state: watch::Sender<MutationState<D>>,
}

impl<V, D, C> Mutation<V, D, C>
where
    V: Clone + Send + 'static,
    D: Clone + Send + Sync + 'static,
{
    pub fn new(options: MutationOptions<V, D, C>) -> Self {
        let (state, _) = watch::channel(MutationState::Idle);
        Self {
            id: Uuid::new_v4(),
            options,
            state,
        }
    }

    pub fn id(&self) -> MutationId {
        self.id
    }

    /// Snapshot of the current state
    pub fn state(&self) -> MutationState<D> {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> MutationStatus {
        self.state.borrow().status()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<MutationState<D>> {
        self.state.subscribe()
    }

    /// Return to `Idle`
    pub fn reset(&self) {
        self.state.send_replace(MutationState::Idle);
    }

    /// Run the mutation with `variables`
    ///
    /// Failures of the mutation function, panics included, surface as
    /// [`CacheError::Mutation`] after `on_error` and `on_settled` have run.
    pub async fn mutate(&self, variables: V) -> Result<D> {
        let context = self.options.on_mutate.as_ref().map(|f| f(&variables));

        self.state.send_replace(MutationState::Loading);
        debug!("Mutation {} started", self.id);

        // The call itself may panic before returning a future
        let write = async { (self.options.mutation_fn)(variables.clone()).await };
        let outcome = match AssertUnwindSafe(write).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(QueryError::from_panic(panic)),
        };

        match outcome {
            Ok(data) => {
                self.state
                    .send_replace(MutationState::Success { data: data.clone() });
                debug!("Mutation {} succeeded", self.id);

                if let Some(on_success) = &self.options.on_success {
                    on_success(&data, &variables, context.as_ref());
                }
                if let Some(on_settled) = &self.options.on_settled {
                    on_settled(Some(&data), None, &variables, context.as_ref());
                }
                Ok(data)
            }
            Err(error) => {
                self.state.send_replace(MutationState::Error {
                    error: error.clone(),
                });
                warn!("Mutation {} failed: {}", self.id, error);

                if let Some(on_error) = &self.options.on_error {
                    on_error(&error, &variables, context.as_ref());
                }
                if let Some(on_settled) = &self.options.on_settled {
                    on_settled(None, Some(&error), &variables, context.as_ref());
                }
                Err(CacheError::Mutation(error))
            }
        }
    }
}

impl<V, D, C> std::fmt::Debug for Mutation<V, D, C>
where
    D: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}
