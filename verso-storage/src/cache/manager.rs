//! Pool name to cache store resolution.

use std::collections::HashMap;
use std::sync::Arc;

use verso_core::{VersoConfig, DEFAULT_POOL};

use super::lmdb_backend::{LmdbCacheError, LmdbCacheStore};
use super::memory::MemoryCacheStore;
use super::multi_level::MultiLevelCache;
use super::traits::CacheStore;

/// Resolves pool names to stores. Pool names are case-insensitive.
///
/// Pools are registered at startup; the manager is immutable afterwards and
/// shared behind an `Arc`. Operations that name no pool use the manager's
/// default pool, `"default"` unless renamed.
#[derive(Clone)]
pub struct CacheManager {
    pools: HashMap<String, Arc<dyn CacheStore>>,
    default_pool: String,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self {
            pools: HashMap::new(),
            default_pool: normalize(DEFAULT_POOL),
        }
    }
}

impl CacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rename the default pool. Stores registered through
    /// [`CacheManager::with_default`] afterwards land under `pool`.
    pub fn with_default_pool(mut self, pool: &str) -> Self {
        self.default_pool = normalize(pool);
        self
    }

    pub fn default_pool(&self) -> &str {
        &self.default_pool
    }

    /// Build the configured default pool: an in-memory near tier, backed by
    /// LMDB when `lmdb_path` is set.
    pub fn from_config(config: &VersoConfig) -> Result<Self, LmdbCacheError> {
        let near: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new("memory"));
        let mut tiers = MultiLevelCache::new(config.default_pool.clone(), near)
            .with_reconnect_interval(config.reconnect_interval);
        if let Some(path) = &config.lmdb_path {
            let far = LmdbCacheStore::new("lmdb", path, config.lmdb_max_size_mb)?;
            tiers = tiers.with_far(Arc::new(far));
        }
        Ok(Self::new()
            .with_default_pool(&config.default_pool)
            .with_default(Arc::new(tiers)))
    }

    /// Register `store` under `pool`, replacing any previous registration.
    pub fn with_pool(mut self, pool: &str, store: Arc<dyn CacheStore>) -> Self {
        self.pools.insert(normalize(pool), store);
        self
    }

    /// Register `store` as the default pool.
    pub fn with_default(self, store: Arc<dyn CacheStore>) -> Self {
        let pool = self.default_pool.clone();
        self.with_pool(&pool, store)
    }

    pub fn cache(&self, pool: &str) -> Option<Arc<dyn CacheStore>> {
        self.pools.get(&normalize(pool)).cloned()
    }

    pub fn default_cache(&self) -> Option<Arc<dyn CacheStore>> {
        self.cache(&self.default_pool)
    }

    pub fn has_pool(&self, pool: &str) -> bool {
        self.pools.contains_key(&normalize(pool))
    }

    /// Registered pool names, lowercased.
    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("pools", &self.pool_names())
            .field("default_pool", &self.default_pool)
            .finish()
    }
}

fn normalize(pool: &str) -> String {
    pool.to_lowercase()
}
