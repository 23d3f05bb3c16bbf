//! Registry of outstanding fetches, at most one per key

use crate::cache::types::{CacheKey, Completion, SharedCompletion};
use futures::FutureExt;
use std::collections::HashMap;

/// Which path started a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchKind {
    Direct,
    Background,
}

/// One outstanding fetch
pub(crate) struct InFlight {
    /// Identifies this fetch; a settling fetch only writes back while it is
    /// still the registered generation for its key
    pub generation: u64,
    pub kind: FetchKind,
    completion: SharedCompletion,
}

impl InFlight {
    pub fn new(generation: u64, kind: FetchKind, completion: SharedCompletion) -> Self {
        Self {
            generation,
            kind,
            completion,
        }
    }

    /// A completion future for a caller joining this fetch
    pub fn join(&self) -> Completion {
        self.completion.clone().boxed()
    }
}

#[derive(Default)]
pub(crate) struct InFlightRegistry {
    fetches: HashMap<CacheKey, InFlight>,
    next_generation: u64,
}

impl InFlightRegistry {
    /// Allocate a generation number for a new fetch
    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn register(&mut self, key: CacheKey, fetch: InFlight) {
        self.fetches.insert(key, fetch);
    }

    pub fn get(&self, key: &str) -> Option<&InFlight> {
        self.fetches.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fetches.contains_key(key)
    }

    /// Whether `generation` is the fetch currently registered for `key`
    pub fn is_current(&self, key: &str, generation: u64) -> bool {
        self.fetches
            .get(key)
            .is_some_and(|fetch| fetch.generation == generation)
    }

    pub fn remove(&mut self, key: &str) -> Option<InFlight> {
        self.fetches.remove(key)
    }

    pub fn clear(&mut self) -> usize {
        let count = self.fetches.len();
        self.fetches.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.fetches.len()
    }
}
