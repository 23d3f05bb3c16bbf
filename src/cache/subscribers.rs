//! Per-key change listeners

use crate::cache::types::CacheKey;
use std::collections::HashMap;
use std::sync::Arc;

/// Callback invoked after every state change of the subscribed key
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Identifies one subscription
pub type SubscriptionId = u64;

/// Handle for one subscription
///
/// Dropping the handle unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    key: CacheKey,
    id: SubscriptionId,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(
        key: CacheKey,
        id: SubscriptionId,
        release: Box<dyn FnOnce() + Send + Sync>,
    ) -> Self {
        Self {
            key,
            id,
            release: Some(release),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stop receiving notifications
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.release.is_some())
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    listeners: HashMap<CacheKey, Vec<(SubscriptionId, Listener)>>,
    next_id: SubscriptionId,
}

impl SubscriberRegistry {
    pub fn add(&mut self, key: &str, listener: Listener) -> SubscriptionId {
        self.next_id += 1;
        let id = self.next_id;
        self.listeners
            .entry(key.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove a listener; returns it with the number of listeners left for
    /// the key, or `None` if the subscription was not registered
    pub fn remove(&mut self, key: &str, id: SubscriptionId) -> Option<(Listener, usize)> {
        let listeners = self.listeners.get_mut(key)?;
        let index = listeners.iter().position(|(sub_id, _)| *sub_id == id)?;
        let (_, listener) = listeners.remove(index);

        let remaining = listeners.len();
        if remaining == 0 {
            self.listeners.remove(key);
        }
        Some((listener, remaining))
    }

    pub fn count(&self, key: &str) -> usize {
        self.listeners.get(key).map_or(0, Vec::len)
    }

    /// Clone the listeners of a key so they can be called without the store lock
    pub fn snapshot(&self, key: &str) -> Vec<Listener> {
        self.listeners
            .get(key)
            .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    pub fn remove_key(&mut self, key: &str) {
        self.listeners.remove(key);
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.listeners.keys().cloned().collect()
    }
}
