//! Cache store trait and statistics.
//!
//! This module defines the uniform interface every backing cache client is
//! adapted to.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use verso_core::CacheResult;

/// Cache store trait for pluggable cache implementations.
///
/// This trait abstracts over different cache clients (in-memory, LMDB,
/// a remote tier). Implementations must be thread-safe and support
/// concurrent access.
///
/// # Errors
///
/// Every failure is reported as `CacheError::Unreachable`. Implementations
/// must not leak driver-specific error types through this trait.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Label used in logs and errors.
    fn name(&self) -> &str;

    /// Store a value with no expiry.
    async fn add(&self, key: &str, value: Value) -> CacheResult<()>;

    /// Store a value that expires after `ttl`.
    async fn add_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> CacheResult<()>;

    /// Remove a key. Returns true if a live entry was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Remove every entry in this store.
    async fn remove_all(&self) -> CacheResult<()>;

    /// Get a value, or `None` if absent or expired.
    async fn get(&self, key: &str) -> CacheResult<Option<Value>>;

    /// Check whether a live entry exists for `key`.
    async fn key_exists(&self, key: &str) -> CacheResult<bool>;

    /// Get store statistics, if the store tracks them.
    async fn stats(&self) -> CacheResult<CacheStats> {
        Ok(CacheStats::default())
    }
}

/// Store `value` with `ttl` when one is configured, otherwise without expiry.
pub async fn add_with_optional_ttl(
    store: &dyn CacheStore,
    key: &str,
    value: Value,
    ttl: Option<Duration>,
) -> CacheResult<()> {
    match ttl {
        Some(ttl) => store.add_with_ttl(key, value, ttl).await,
        None => store.add(key, value).await,
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Approximate memory usage in bytes.
    pub memory_bytes: u64,
    /// Number of entries dropped because they expired.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
