//! Near/far cache composition with a reachability gate on the far tier.
//!
//! The near tier is authoritative for errors: its failures surface to the
//! caller. The far tier is best-effort. Once it fails it is skipped until
//! `reconnect_interval` has passed, then probed again (half-open). Any
//! successful far call closes the gate.
//!
//! Tiers form a linked list: the far tier may itself be a `MultiLevelCache`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use verso_core::{CacheError, CacheResult, DEFAULT_RECONNECT_INTERVAL_MS};

use super::traits::{CacheStats, CacheStore};

/// Reachability of the far tier.
///
/// The flag and the failure instant are updated independently. Concurrent
/// callers may both decide to probe; that costs an extra call, never a
/// permanent lockout.
#[derive(Debug)]
pub struct Reachability {
    reachable: AtomicBool,
    last_failure: RwLock<Option<Instant>>,
    reconnect_interval: Duration,
}

impl Reachability {
    pub fn new(reconnect_interval: Duration) -> Self {
        Self {
            reachable: AtomicBool::new(true),
            last_failure: RwLock::new(None),
            reconnect_interval,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure.read().ok().and_then(|guard| *guard)
    }

    /// Whether a far-tier call may be attempted now.
    pub fn is_allowed(&self) -> bool {
        if self.is_reachable() {
            return true;
        }
        match self.last_failure() {
            Some(last) => last.elapsed() > self.reconnect_interval,
            // Flag down without a recorded failure: nothing to wait for.
            None => true,
        }
    }

    pub fn record_failure(&self) {
        if let Ok(mut guard) = self.last_failure.write() {
            *guard = Some(Instant::now());
        }
        self.reachable.store(false, Ordering::Relaxed);
    }

    /// Returns true if this success closed a previously open gate.
    pub fn record_success(&self) -> bool {
        !self.reachable.swap(true, Ordering::Relaxed)
    }
}

/// A near-tier store backed by an optional far-tier store.
pub struct MultiLevelCache {
    name: String,
    near: Arc<dyn CacheStore>,
    far: Option<Arc<dyn CacheStore>>,
    reachability: Reachability,
}

impl MultiLevelCache {
    /// Near tier only. Behaves exactly like `near`.
    pub fn new(name: impl Into<String>, near: Arc<dyn CacheStore>) -> Self {
        Self {
            name: name.into(),
            near,
            far: None,
            reachability: Reachability::new(Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS)),
        }
    }

    /// Attach a far tier.
    pub fn with_far(mut self, far: Arc<dyn CacheStore>) -> Self {
        self.far = Some(far);
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reachability = Reachability::new(interval);
        self
    }

    pub fn reachability(&self) -> &Reachability {
        &self.reachability
    }

    pub fn near(&self) -> &Arc<dyn CacheStore> {
        &self.near
    }

    pub fn far(&self) -> Option<&Arc<dyn CacheStore>> {
        self.far.as_ref()
    }

    /// The far tier, if one is attached and the gate allows a call.
    fn gated_far(&self) -> Option<&Arc<dyn CacheStore>> {
        let far = self.far.as_ref()?;
        if self.reachability.is_allowed() {
            Some(far)
        } else {
            tracing::trace!(cache = %self.name, far = %far.name(), "far tier skipped while unreachable");
            None
        }
    }

    /// Record the outcome of a far-tier call, absorbing its error.
    fn settle<T>(&self, far: &Arc<dyn CacheStore>, result: CacheResult<T>) -> Option<T> {
        match result {
            Ok(value) => {
                if self.reachability.record_success() {
                    tracing::info!(cache = %self.name, far = %far.name(), "far tier reachable again");
                }
                Some(value)
            }
            Err(CacheError::Unreachable { reason, .. }) => {
                self.reachability.record_failure();
                tracing::warn!(
                    cache = %self.name,
                    far = %far.name(),
                    reason = %reason,
                    "far tier unreachable, skipping it until the reconnect interval passes"
                );
                None
            }
        }
    }
}

#[async_trait]
impl CacheStore for MultiLevelCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, key: &str, value: Value) -> CacheResult<()> {
        self.near.add(key, value.clone()).await?;
        if let Some(far) = self.gated_far() {
            let result = far.add(key, value).await;
            self.settle(far, result);
        }
        Ok(())
    }

    async fn add_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> CacheResult<()> {
        self.near.add_with_ttl(key, value.clone(), ttl).await?;
        if let Some(far) = self.gated_far() {
            let result = far.add_with_ttl(key, value, ttl).await;
            self.settle(far, result);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let near_removed = self.near.delete(key).await?;
        let far_removed = match self.gated_far() {
            Some(far) => {
                let result = far.delete(key).await;
                self.settle(far, result).unwrap_or(false)
            }
            None => false,
        };
        Ok(near_removed || far_removed)
    }

    async fn remove_all(&self) -> CacheResult<()> {
        self.near.remove_all().await?;
        if let Some(far) = self.gated_far() {
            let result = far.remove_all().await;
            self.settle(far, result);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        if let Some(value) = self.near.get(key).await? {
            return Ok(Some(value));
        }
        match self.gated_far() {
            Some(far) => {
                let result = far.get(key).await;
                Ok(self.settle(far, result).flatten())
            }
            None => Ok(None),
        }
    }

    async fn key_exists(&self, key: &str) -> CacheResult<bool> {
        if self.near.key_exists(key).await? {
            return Ok(true);
        }
        match self.gated_far() {
            Some(far) => {
                let result = far.key_exists(key).await;
                Ok(self.settle(far, result).unwrap_or(false))
            }
            None => Ok(false),
        }
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        self.near.stats().await
    }
}
