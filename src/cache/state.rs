//! Per-entry query state machine

use crate::error::QueryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// When an entry's data was last written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatedAt {
    /// Written at this monotonic instant
    At(Instant),

    /// Treat as infinitely old regardless of the configured stale time
    ForceStale,
}

impl UpdatedAt {
    /// Stamp with the current instant
    pub fn now() -> Self {
        UpdatedAt::At(Instant::now())
    }

    /// Time elapsed since the update; `None` means infinitely long ago
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        match self {
            UpdatedAt::At(at) => Some(now.saturating_duration_since(*at)),
            UpdatedAt::ForceStale => None,
        }
    }

    /// Check whether the data has outlived `stale_time`
    ///
    /// Compared in whole milliseconds, so a read in the same millisecond as
    /// the write is fresh even with a zero stale time.
    pub fn is_stale(&self, stale_time: Duration, now: Instant) -> bool {
        match self.elapsed(now) {
            Some(elapsed) => elapsed.as_millis() > stale_time.as_millis(),
            None => true,
        }
    }

    /// Check whether the update happened less than `window` ago
    pub fn is_within(&self, window: Duration, now: Instant) -> bool {
        matches!(self.elapsed(now), Some(elapsed) if elapsed < window)
    }
}

/// Discriminant of [`QueryState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryStatus {
    Idle,
    Loading,
    Fetching,
    FirstSuccess,
    Success,
    Error,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Idle => write!(f, "idle"),
            QueryStatus::Loading => write!(f, "loading"),
            QueryStatus::Fetching => write!(f, "fetching"),
            QueryStatus::FirstSuccess => write!(f, "first-success"),
            QueryStatus::Success => write!(f, "success"),
            QueryStatus::Error => write!(f, "error"),
        }
    }
}

/// State of one cache entry
///
/// Every variant carries `updated_at`. Only the variants that can hold data
/// have a data field, so a loading or failed entry can never expose stale
/// data by accident.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
    /// No fetch issued yet, or the last fetch was cancelled
    Idle {
        data: Option<T>,
        updated_at: UpdatedAt,
    },

    /// First fetch for this key in progress
    Loading { updated_at: UpdatedAt },

    /// Background revalidation in progress; `data` and `updated_at` are the
    /// values being revalidated
    Fetching { data: T, updated_at: UpdatedAt },

    /// First successful population, including via initial data
    FirstSuccess { data: T, updated_at: UpdatedAt },

    /// Populated and settled
    Success { data: T, updated_at: UpdatedAt },

    /// Most recent direct fetch failed
    Error {
        error: QueryError,
        updated_at: UpdatedAt,
    },
}

impl<T> QueryState<T> {
    /// The state's discriminant
    pub fn status(&self) -> QueryStatus {
        match self {
            QueryState::Idle { .. } => QueryStatus::Idle,
            QueryState::Loading { .. } => QueryStatus::Loading,
            QueryState::Fetching { .. } => QueryStatus::Fetching,
            QueryState::FirstSuccess { .. } => QueryStatus::FirstSuccess,
            QueryState::Success { .. } => QueryStatus::Success,
            QueryState::Error { .. } => QueryStatus::Error,
        }
    }

    /// Cached data, if the state holds any
    pub fn data(&self) -> Option<&T> {
        match self {
            QueryState::Idle { data, .. } => data.as_ref(),
            QueryState::Fetching { data, .. }
            | QueryState::FirstSuccess { data, .. }
            | QueryState::Success { data, .. } => Some(data),
            QueryState::Loading { .. } | QueryState::Error { .. } => None,
        }
    }

    /// Consume the state and return its data
    pub fn into_data(self) -> Option<T> {
        match self {
            QueryState::Idle { data, .. } => data,
            QueryState::Fetching { data, .. }
            | QueryState::FirstSuccess { data, .. }
            | QueryState::Success { data, .. } => Some(data),
            QueryState::Loading { .. } | QueryState::Error { .. } => None,
        }
    }

    /// The error of a failed direct fetch
    pub fn error(&self) -> Option<&QueryError> {
        match self {
            QueryState::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn updated_at(&self) -> UpdatedAt {
        match self {
            QueryState::Idle { updated_at, .. }
            | QueryState::Loading { updated_at }
            | QueryState::Fetching { updated_at, .. }
            | QueryState::FirstSuccess { updated_at, .. }
            | QueryState::Success { updated_at, .. }
            | QueryState::Error { updated_at, .. } => *updated_at,
        }
    }

    /// Same state with a different timestamp
    pub fn with_updated_at(self, updated_at: UpdatedAt) -> Self {
        match self {
            QueryState::Idle { data, .. } => QueryState::Idle { data, updated_at },
            QueryState::Loading { .. } => QueryState::Loading { updated_at },
            QueryState::Fetching { data, .. } => QueryState::Fetching { data, updated_at },
            QueryState::FirstSuccess { data, .. } => QueryState::FirstSuccess { data, updated_at },
            QueryState::Success { data, .. } => QueryState::Success { data, updated_at },
            QueryState::Error { error, .. } => QueryState::Error { error, updated_at },
        }
    }

    /// `Success` or `FirstSuccess`
    pub fn is_settled_success(&self) -> bool {
        matches!(
            self,
            QueryState::Success { .. } | QueryState::FirstSuccess { .. }
        )
    }

    /// A fetch of either kind is in progress
    pub fn is_fetching(&self) -> bool {
        matches!(self, QueryState::Loading { .. } | QueryState::Fetching { .. })
    }
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        QueryState::Idle {
            data: None,
            updated_at: UpdatedAt::ForceStale,
        }
    }
}
