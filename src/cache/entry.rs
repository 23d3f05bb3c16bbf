//! Cache entry: query state plus the function that refreshes it

use crate::cache::state::{QueryState, UpdatedAt};
use crate::cache::types::QueryFn;
use std::fmt;

/// A cache entry
///
/// The state is replaced on every transition, never patched in place.
pub struct CacheEntry<T> {
    /// Current state of the query
    pub state: QueryState<T>,

    /// Fetch function recorded by the last fetch for this key
    pub(crate) query_fn: Option<QueryFn<T>>,

    /// Number of times data has been written to this entry
    pub(crate) data_update_count: u64,
}

impl<T> CacheEntry<T> {
    /// Create an idle entry with no data
    pub fn new(query_fn: Option<QueryFn<T>>) -> Self {
        Self {
            state: QueryState::default(),
            query_fn,
            data_update_count: 0,
        }
    }

    /// Whether a fetch function is recorded for this entry
    pub fn has_query_fn(&self) -> bool {
        self.query_fn.is_some()
    }

    /// Number of times data has been written to this entry
    pub fn data_update_count(&self) -> u64 {
        self.data_update_count
    }

    /// Whether data has ever been recorded
    pub fn has_recorded_data(&self) -> bool {
        self.data_update_count > 0
    }

    /// Replace the state with fresh data
    ///
    /// The first write lands in `FirstSuccess` when `mark_first` is set,
    /// every later write in `Success`.
    pub(crate) fn record_data(&mut self, data: T, mark_first: bool) {
        let updated_at = UpdatedAt::now();
        self.state = if mark_first && self.data_update_count == 0 {
            QueryState::FirstSuccess { data, updated_at }
        } else {
            QueryState::Success { data, updated_at }
        };
        self.data_update_count += 1;
    }

    /// Populate from caller-supplied initial data
    pub(crate) fn seed(&mut self, data: T) {
        self.state = QueryState::FirstSuccess {
            data,
            updated_at: UpdatedAt::now(),
        };
        self.data_update_count += 1;
    }

    /// Mark the entry as infinitely old, keeping its payload
    pub(crate) fn force_stale(&mut self) {
        let state = std::mem::take(&mut self.state);
        self.state = state.with_updated_at(UpdatedAt::ForceStale);
    }
}

impl<T: Clone> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            query_fn: self.query_fn.clone(),
            data_update_count: self.data_update_count,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for CacheEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("state", &self.state)
            .field("has_query_fn", &self.query_fn.is_some())
            .field("data_update_count", &self.data_update_count)
            .finish()
    }
}
