//! Cache-wide lifecycle events
//!
//! Per-key subscribers only learn that *something* changed. Events carry the
//! what and when for every key, for logging, metrics or devtools-style
//! inspection:
//! - Added / Updated: an entry was created or changed state
//! - Invalidated / Cancelled: manual intervention on an entry
//! - Removed: the entry left the cache, with the reason

use crate::cache::state::QueryStatus;
use crate::cache::types::CacheKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemovalReason {
    /// Evicted by the GC scheduler after its grace period
    Collected,

    /// Removed explicitly by key
    Removed,

    /// Dropped by a whole-cache clear
    Cleared,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalReason::Collected => write!(f, "garbage collected"),
            RemovalReason::Removed => write!(f, "manual removal"),
            RemovalReason::Cleared => write!(f, "cache cleared"),
        }
    }
}

/// What happened to an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheEventKind {
    /// Entry created
    Added,

    /// Entry transitioned to a new state
    Updated { status: QueryStatus },

    /// Entry marked stale by hand
    Invalidated,

    /// In-flight fetch abandoned
    Cancelled,

    /// Entry left the cache
    Removed { reason: RemovalReason },
}

impl std::fmt::Display for CacheEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheEventKind::Added => write!(f, "added"),
            CacheEventKind::Updated { status } => write!(f, "updated to {}", status),
            CacheEventKind::Invalidated => write!(f, "invalidated"),
            CacheEventKind::Cancelled => write!(f, "cancelled"),
            CacheEventKind::Removed { reason } => write!(f, "removed ({})", reason),
        }
    }
}

/// Event emitted on the cache event channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEvent {
    /// What happened
    pub kind: CacheEventKind,

    /// Key it happened to
    pub key: CacheKey,

    /// When it happened (wall clock)
    pub timestamp: DateTime<Utc>,
}

impl CacheEvent {
    /// Create a new event stamped with the current time
    pub fn new(kind: CacheEventKind, key: impl Into<CacheKey>) -> Self {
        Self {
            kind,
            key: key.into(),
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn updated(key: &str, status: QueryStatus) -> Self {
        Self::new(CacheEventKind::Updated { status }, key)
    }

    pub(crate) fn removed(key: &str, reason: RemovalReason) -> Self {
        Self::new(CacheEventKind::Removed { reason }, key)
    }
}
