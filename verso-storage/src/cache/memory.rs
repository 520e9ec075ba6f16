//! Process-local cache store with per-entry expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use verso_core::{CacheError, CacheResult};

use super::traits::{CacheStats, CacheStore};

const DEFAULT_SWEEP_EVERY: usize = 256;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now < at).unwrap_or(true)
    }
}

/// In-memory cache store.
///
/// Expired entries read as absent. They are dropped on the next access to
/// their key, and every `sweep_every` writes the whole map is swept.
/// Typically used as the near tier of a [`super::MultiLevelCache`].
#[derive(Debug)]
pub struct MemoryCacheStore {
    name: String,
    entries: RwLock<HashMap<String, MemoryEntry>>,
    stats: RwLock<CacheStats>,
    sweep_every: usize,
    writes: AtomicUsize,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryCacheStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            sweep_every: DEFAULT_SWEEP_EVERY,
            writes: AtomicUsize::new(0),
        }
    }

    /// Sweep expired entries every `writes` inserts (at least one).
    pub fn with_sweep_every(mut self, writes: usize) -> Self {
        self.sweep_every = writes.max(1);
        self
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> CacheResult<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| self.poisoned())?;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let removed = before - entries.len();
        let count = entries.len() as u64;
        drop(entries);

        if let Ok(mut stats) = self.stats.write() {
            stats.evictions += removed as u64;
            stats.entry_count = count;
        }
        Ok(removed)
    }

    /// Number of entries held, live or not yet swept.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned(&self) -> CacheError {
        CacheError::unreachable(&self.name, "memory store lock poisoned")
    }

    fn insert(&self, key: &str, value: Value, ttl: Option<Duration>) -> CacheResult<()> {
        // A TTL past the clock's range never expires.
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        let mut entries = self.entries.write().map_err(|_| self.poisoned())?;
        entries.insert(key.to_string(), MemoryEntry { value, expires_at });
        let count = entries.len() as u64;
        drop(entries);

        if let Ok(mut stats) = self.stats.write() {
            stats.entry_count = count;
        }

        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.sweep_every == 0 {
            self.purge_expired()?;
        }
        Ok(())
    }

    /// Look up a live entry, sweeping it if expired.
    fn live(&self, key: &str) -> CacheResult<Option<Value>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().map_err(|_| self.poisoned())?;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().map_err(|_| self.poisoned())?;
        let still_expired = entries.get(key).map(|e| !e.is_live(now)).unwrap_or(false);
        if still_expired {
            entries.remove(key);
            let count = entries.len() as u64;
            drop(entries);
            if let Ok(mut stats) = self.stats.write() {
                stats.evictions += 1;
                stats.entry_count = count;
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, key: &str, value: Value) -> CacheResult<()> {
        self.insert(key, value, None)
    }

    async fn add_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> CacheResult<()> {
        self.insert(key, value, Some(ttl))
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| self.poisoned())?;
        let removed = entries.remove(key);
        let count = entries.len() as u64;
        drop(entries);

        if let Ok(mut stats) = self.stats.write() {
            stats.entry_count = count;
        }
        Ok(removed.map(|e| e.is_live(now)).unwrap_or(false))
    }

    async fn remove_all(&self) -> CacheResult<()> {
        self.entries.write().map_err(|_| self.poisoned())?.clear();
        if let Ok(mut stats) = self.stats.write() {
            stats.entry_count = 0;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let found = self.live(key)?;
        if let Ok(mut stats) = self.stats.write() {
            if found.is_some() {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        }
        Ok(found)
    }

    async fn key_exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.live(key)?.is_some())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        Ok(self.stats.read().map(|s| s.clone()).unwrap_or_default())
    }
}
