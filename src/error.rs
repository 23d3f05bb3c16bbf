//! Error types for query cache operations
//!
//! Two layers are defined here:
//! - [`QueryError`]: the coerced, cloneable error stored in query and mutation state
//! - [`CacheError`]: the error returned by cache operations

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// A direct fetch failed; the entry is now in the error state
    #[error("Query '{key}' failed: {error}")]
    Fetch {
        key: String,
        #[source]
        error: QueryError,
    },

    /// The fetch was cancelled before its result could be applied
    #[error("Query '{key}' was cancelled")]
    Cancelled { key: String },

    /// Refetch requested for a key that has no recorded fetch function
    #[error("No fetch function registered for query '{key}'")]
    MissingQueryFn { key: String },

    /// A mutation function failed
    #[error("Mutation failed: {0}")]
    Mutation(#[source] QueryError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}

impl CacheError {
    /// The underlying query or mutation error, if this error wraps one
    pub fn query_error(&self) -> Option<&QueryError> {
        match self {
            CacheError::Fetch { error, .. } | CacheError::Mutation(error) => Some(error),
            _ => None,
        }
    }

    /// Whether this error is the result of a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled { .. })
    }
}

/// Error produced by a query or mutation function
///
/// Whatever the function failed with is coerced into this shape so that
/// stored state always exposes a message. The original error is kept as the
/// source and can be recovered with [`QueryError::downcast_ref`].
#[derive(Clone)]
pub struct QueryError {
    message: String,
    inner: Option<Arc<anyhow::Error>>,
}

impl QueryError {
    /// Create an error from a plain message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            inner: None,
        }
    }

    /// Coerce any error convertible into `anyhow::Error`
    pub fn coerce<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        let error = error.into();
        Self {
            message: error.to_string(),
            inner: Some(Arc::new(error)),
        }
    }

    /// Build an error from a caught panic payload
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::new(format!("function panicked: {}", detail))
    }

    /// The human-readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Attempt to downcast the original error
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.inner.as_ref().and_then(|e| e.downcast_ref::<E>())
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryError")
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.as_ref().and_then(|e| e.source())
    }
}

impl PartialEq for QueryError {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
    }
}

impl From<anyhow::Error> for QueryError {
    fn from(e: anyhow::Error) -> Self {
        QueryError::coerce(e)
    }
}

impl From<&str> for QueryError {
    fn from(s: &str) -> Self {
        QueryError::new(s)
    }
}

impl From<String> for QueryError {
    fn from(s: String) -> Self {
        QueryError::new(s)
    }
}
