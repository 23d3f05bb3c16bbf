//! Configuration for the query cache

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable for [`QueryCacheConfig::stale_time`] (milliseconds)
pub const ENV_STALE_TIME_MS: &str = "QUERY_CACHE_STALE_TIME_MS";
/// Environment variable for [`QueryCacheConfig::gc_time`] (milliseconds)
pub const ENV_GC_TIME_MS: &str = "QUERY_CACHE_GC_TIME_MS";
/// Environment variable for [`QueryCacheConfig::first_success_buffer`] (milliseconds)
pub const ENV_FIRST_SUCCESS_BUFFER_MS: &str = "QUERY_CACHE_FIRST_SUCCESS_BUFFER_MS";
/// Environment variable for [`QueryCacheConfig::gc_jitter`]
pub const ENV_GC_JITTER: &str = "QUERY_CACHE_GC_JITTER";
/// Environment variable for [`QueryCacheConfig::event_capacity`]
pub const ENV_EVENT_CAPACITY: &str = "QUERY_CACHE_EVENT_CAPACITY";

/// Configuration for the query cache
///
/// Defaults:
/// - Stale time: 0 (every read of a settled entry revalidates)
/// - GC time: 5 minutes after the last subscriber leaves
/// - First-success buffer: 300ms, suppresses a refetch right after first population
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCacheConfig {
    /// How long fetched data is considered fresh
    pub stale_time: Duration,

    /// Grace period between the last unsubscribe and eviction
    pub gc_time: Duration,

    /// Window after a first success during which background fetches are skipped
    pub first_success_buffer: Duration,

    /// GC jitter factor (0.0 - 1.0)
    /// Spreads evictions of keys released together
    pub gc_jitter: f64,

    /// Capacity of the cache event channel
    pub event_capacity: usize,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            // 5 minutes
            gc_time: Duration::from_secs(300),
            first_success_buffer: Duration::from_millis(300),
            gc_jitter: 0.0,
            event_capacity: 256,
        }
    }
}

impl QueryCacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> QueryCacheConfigBuilder {
        QueryCacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.gc_jitter) {
            return Err(CacheError::ConfigError(
                "gc_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.event_capacity == 0 {
            return Err(CacheError::ConfigError(
                "event_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Calculate the actual GC delay with jitter applied
    ///
    /// Delays too large for a `Duration` keep the configured `gc_time`, so
    /// `Duration::MAX` still means "never collect".
    pub fn gc_time_with_jitter(&self) -> Duration {
        if self.gc_jitter == 0.0 || self.gc_time.is_zero() {
            return self.gc_time;
        }

        let base_secs = self.gc_time.as_secs_f64();
        let jitter_range = base_secs * self.gc_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(0.0);

        Duration::try_from_secs_f64(final_secs).unwrap_or(self.gc_time)
    }

    /// Load configuration from the environment, reading a `.env` file if present
    ///
    /// Unset variables fall back to the defaults.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_STALE_TIME_MS)? {
            builder = builder.stale_time(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_GC_TIME_MS)? {
            builder = builder.gc_time(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_FIRST_SUCCESS_BUFFER_MS)? {
            builder = builder.first_success_buffer(Duration::from_millis(ms));
        }
        if let Some(jitter) = parse_var::<f64, _>(&lookup, ENV_GC_JITTER)? {
            builder = builder.gc_jitter(jitter);
        }
        if let Some(capacity) = parse_var::<usize, _>(&lookup, ENV_EVENT_CAPACITY)? {
            builder = builder.event_capacity(capacity);
        }

        builder.build()
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CacheError::ConfigError(format!("invalid {}={:?}: {}", name, raw, e))),
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct QueryCacheConfigBuilder {
    stale_time: Option<Duration>,
    gc_time: Option<Duration>,
    first_success_buffer: Option<Duration>,
    gc_jitter: Option<f64>,
    event_capacity: Option<usize>,
}

impl QueryCacheConfigBuilder {
    /// Set how long fetched data stays fresh
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Set the grace period before unused entries are evicted
    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    /// Set the post-first-success refetch suppression window
    pub fn first_success_buffer(mut self, buffer: Duration) -> Self {
        self.first_success_buffer = Some(buffer);
        self
    }

    /// Set GC jitter factor (0.0 - 1.0)
    pub fn gc_jitter(mut self, jitter: f64) -> Self {
        self.gc_jitter = Some(jitter);
        self
    }

    /// Set the event channel capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Build and validate the cache configuration
    pub fn build(self) -> Result<QueryCacheConfig> {
        let defaults = QueryCacheConfig::default();

        let config = QueryCacheConfig {
            stale_time: self.stale_time.unwrap_or(defaults.stale_time),
            gc_time: self.gc_time.unwrap_or(defaults.gc_time),
            first_success_buffer: self
                .first_success_buffer
                .unwrap_or(defaults.first_success_buffer),
            gc_jitter: self.gc_jitter.unwrap_or(defaults.gc_jitter),
            event_capacity: self.event_capacity.unwrap_or(defaults.event_capacity),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Preset configurations for common use cases
impl QueryCacheConfig {
    /// Always revalidate, release unused data quickly
    pub fn realtime() -> Self {
        Self {
            stale_time: Duration::ZERO,
            gc_time: Duration::from_secs(60),
            ..Default::default()
        }
    }

    /// Data that rarely changes: fresh for an hour, kept for a day
    pub fn static_content() -> Self {
        Self {
            stale_time: Duration::from_secs(3600),
            gc_time: Duration::from_secs(24 * 3600),
            gc_jitter: 0.10,
            ..Default::default()
        }
    }

    /// Memory-constrained environments
    pub fn small() -> Self {
        Self {
            stale_time: Duration::from_secs(30),
            gc_time: Duration::from_secs(30),
            event_capacity: 32,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = QueryCacheConfig::default();
        assert_eq!(config.stale_time, Duration::ZERO);
        assert_eq!(config.gc_time, Duration::from_secs(300));
        assert_eq!(config.first_success_buffer, Duration::from_millis(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut invalid_config = QueryCacheConfig::default();
        invalid_config.gc_jitter = 1.5;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = QueryCacheConfig::default();
        invalid_config.event_capacity = 0;
        assert!(invalid_config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = QueryCacheConfig::builder()
            .stale_time(Duration::from_secs(10))
            .gc_time(Duration::from_secs(60))
            .event_capacity(8)
            .build()
            .unwrap();

        assert_eq!(config.stale_time, Duration::from_secs(10));
        assert_eq!(config.gc_time, Duration::from_secs(60));
        assert_eq!(config.event_capacity, 8);
        assert_eq!(config.first_success_buffer, Duration::from_millis(300));
    }

    #[test]
    fn test_gc_time_with_jitter() {
        let config = QueryCacheConfig {
            gc_time: Duration::from_secs(100),
            gc_jitter: 0.1,
            ..Default::default()
        };

        let gc = config.gc_time_with_jitter();
        assert!(gc.as_secs_f64() >= 90.0);
        assert!(gc.as_secs_f64() <= 110.0);

        let exact = QueryCacheConfig::default();
        assert_eq!(exact.gc_time_with_jitter(), exact.gc_time);
    }

    #[test]
    fn test_gc_time_with_jitter_saturates_at_max() {
        let config = QueryCacheConfig {
            gc_time: Duration::MAX,
            gc_jitter: 0.10,
            ..QueryCacheConfig::static_content()
        };
        assert!(config.validate().is_ok());

        for _ in 0..50 {
            let gc = config.gc_time_with_jitter();
            assert!(gc.as_secs_f64() >= Duration::MAX.as_secs_f64() * 0.89);
        }
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let err = QueryCacheConfig::builder().gc_jitter(5.0).build().unwrap_err();
        assert!(matches!(err, CacheError::ConfigError(_)));

        let err = QueryCacheConfig::builder().event_capacity(0).build().unwrap_err();
        assert!(err.to_string().contains("event_capacity"));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_STALE_TIME_MS, "1500"),
            (ENV_GC_TIME_MS, "2000"),
            (ENV_GC_JITTER, "0.05"),
        ]
        .into_iter()
        .collect();

        let config =
            QueryCacheConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.stale_time, Duration::from_millis(1500));
        assert_eq!(config.gc_time, Duration::from_millis(2000));
        assert_eq!(config.gc_jitter, 0.05);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = QueryCacheConfig::from_lookup(|name| {
            (name == ENV_GC_TIME_MS).then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, CacheError::ConfigError(_)));

        let err = QueryCacheConfig::from_lookup(|name| {
            (name == ENV_GC_JITTER).then(|| "3.0".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("gc_jitter"));
    }

    #[test]
    fn test_preset_configs() {
        assert_eq!(QueryCacheConfig::realtime().gc_time, Duration::from_secs(60));
        assert_eq!(
            QueryCacheConfig::static_content().stale_time,
            Duration::from_secs(3600)
        );
        assert_eq!(QueryCacheConfig::small().event_capacity, 32);
    }
}
