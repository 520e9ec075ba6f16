//! Versioned read-through caching.
//!
//! Entries are validated against a version key rather than by age alone. A
//! cached entry carries the stamp that was current when it was written; it is
//! a hit only while its version key still holds that stamp. Writers refresh
//! version keys to invalidate every entry written under them at once.
//!
//! Cache infrastructure never fails a call. Unreachable stores and keys that
//! cannot be resolved send the call straight to the backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use verso_core::{
    expand_batch, page_meta_key, paged_key, BoundArgs, CacheEntry, ConfigError, KeyResolver,
    KeyTemplate, PageDescriptor, PageMeta, VersionStamp, VersoConfig, VersoError, VersoResult,
};

use crate::cache::{add_with_optional_ttl, CacheManager, CacheRead, CacheStore, ReadOutcome};
use crate::coalesce::{OperationKey, Registration, RequestCoalescer};
use crate::operation::{
    CachePath, Maintenance, OperationDescriptor, OperationRegistry, ReadThrough, ResultShape,
};

/// One invocation's inputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Call {
    pub args: BoundArgs,
    /// Pagination state. The backend sets `total`; a cache hit copies it back.
    pub page: Option<PageDescriptor>,
}

impl Call {
    pub fn new(args: BoundArgs) -> Self {
        Self { args, page: None }
    }

    pub fn with_page(mut self, page: PageDescriptor) -> Self {
        self.page = Some(page);
        self
    }

    pub fn page_number(&self) -> Option<u32> {
        self.page.map(|p| p.current_page)
    }
}

/// Executes an operation against the source of truth.
#[async_trait]
pub trait BackendExecutor: Send + Sync {
    /// Run the call. `Ok(None)` means the source has no result.
    async fn execute(&self, call: &mut Call) -> VersoResult<Option<Value>>;
}

/// What a backend execution produced, as shared with coalesced callers.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOutcome {
    pub value: Option<Value>,
    pub total: Option<u64>,
}

/// Outcome delivered to every member of a coalesced group.
pub type SharedOutcome = Result<BackendOutcome, VersoError>;

/// Coalescer type used by [`VersionedCache`].
pub type BackendCoalescer = RequestCoalescer<OperationKey, SharedOutcome>;

/// Counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolStats {
    pub hits: u64,
    pub misses: u64,
    /// Calls whose cache path failed and were served by the backend alone.
    pub bypasses: u64,
    pub stamps_minted: u64,
    /// Calls served by another caller's in-flight execution.
    pub coalesced: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
    stamps_minted: AtomicU64,
    coalesced: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProtocolStats {
        ProtocolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
            stamps_minted: self.stamps_minted.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

/// A version comparison made while probing, reused when re-caching.
#[derive(Debug, Clone)]
struct Compared {
    version_key: String,
    current: VersionStamp,
}

enum Probe {
    Hit {
        value: Value,
        version: VersionStamp,
        total: Option<u64>,
    },
    Miss {
        compared: Option<Compared>,
    },
}

/// The backend's result plus whether another caller executed it.
struct Loaded {
    value: Option<Value>,
    shared: bool,
}

/// Versioned cache-aside layer over a [`CacheManager`].
pub struct VersionedCache {
    manager: Arc<CacheManager>,
    coalescer: Arc<BackendCoalescer>,
    registry: OperationRegistry,
    resolver: KeyResolver,
    config: VersoConfig,
    counters: Counters,
}

impl VersionedCache {
    pub fn new(manager: Arc<CacheManager>, config: VersoConfig) -> Self {
        Self {
            manager,
            coalescer: Arc::new(RequestCoalescer::new()),
            registry: OperationRegistry::new(),
            resolver: KeyResolver::default(),
            config,
            counters: Counters::default(),
        }
    }

    /// Share a coalescer with other owners.
    pub fn with_coalescer(mut self, coalescer: Arc<BackendCoalescer>) -> Self {
        self.coalescer = coalescer;
        self
    }

    /// Use a custom argument extractor for key resolution.
    pub fn with_resolver(mut self, resolver: KeyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &VersoConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub fn coalescer(&self) -> &Arc<BackendCoalescer> {
        &self.coalescer
    }

    pub fn stats(&self) -> ProtocolStats {
        self.counters.snapshot()
    }

    /// Validate and register an operation.
    ///
    /// Operations that touch the cache must name a pool the manager knows.
    pub fn register(&self, descriptor: OperationDescriptor) -> VersoResult<Arc<OperationDescriptor>> {
        let pool = descriptor.pool_or(self.manager.default_pool());
        let uses_cache = !matches!(descriptor.cache_path(), CachePath::PassThrough);
        if uses_cache && !self.manager.has_pool(pool) {
            return Err(ConfigError::InvalidValue {
                field: "pool".to_string(),
                value: pool.to_string(),
                reason: "no cache store is registered under this pool".to_string(),
            }
            .into());
        }
        let registered = self.registry.insert(descriptor)?;
        tracing::debug!(operation = %registered.id(), "registered operation");
        Ok(registered)
    }

    pub fn operation(&self, id: &str) -> VersoResult<Arc<OperationDescriptor>> {
        Ok(self.registry.get(id)?)
    }

    /// Invoke a registered operation.
    pub async fn invoke(&self, id: &str, call: &mut Call, backend: &dyn BackendExecutor) -> VersoResult<Option<Value>> {
        Ok(self.invoke_traced(id, call, backend).await?.into_value())
    }

    /// Invoke a registered operation, reporting how it was served.
    pub async fn invoke_traced(
        &self,
        id: &str,
        call: &mut Call,
        backend: &dyn BackendExecutor,
    ) -> VersoResult<CacheRead<Option<Value>>> {
        let op = self.registry.get(id)?;
        match op.cache_path() {
            CachePath::ReadThrough(read) => self.read_through(&op, read, call, backend).await,
            CachePath::Maintenance(maintenance) => self.write_through(&op, maintenance, call, backend).await,
            CachePath::PassThrough => {
                let loaded = self.load(&op, "", call, backend).await?;
                let outcome = if loaded.shared {
                    ReadOutcome::Coalesced
                } else {
                    ReadOutcome::PassThrough
                };
                Ok(CacheRead::with_outcome(loaded.value, outcome))
            }
        }
    }

    /// Invoke once per element of the operation's batch parameters.
    ///
    /// Array-valued batch arguments are zipped into one call each; other
    /// arguments are shared. Results come back in element order.
    pub async fn invoke_batch(
        &self,
        id: &str,
        args: &BoundArgs,
        backend: &dyn BackendExecutor,
    ) -> VersoResult<Vec<Option<Value>>> {
        let op = self.registry.get(id)?;
        let params: Vec<&str> = op.batch_params().iter().map(String::as_str).collect();
        let tuples = if params.is_empty() {
            vec![args.clone()]
        } else {
            expand_batch(args, &params)?
        };

        let mut results = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            let mut call = Call::new(tuple);
            results.push(self.invoke(id, &mut call, backend).await?);
        }
        Ok(results)
    }

    fn store_for(&self, op: &OperationDescriptor) -> Option<Arc<dyn CacheStore>> {
        self.manager.cache(op.pool_or(self.manager.default_pool()))
    }

    fn ttl_for(&self, op: &OperationDescriptor) -> Option<Duration> {
        op.ttl().or(self.config.default_ttl)
    }

    fn is_paged(op: &OperationDescriptor, call: &Call) -> bool {
        op.is_paginated() && call.page.is_some()
    }

    fn cache_key(&self, op: &OperationDescriptor, read: &ReadThrough, call: &Call) -> VersoResult<String> {
        let key = self.resolver.resolve(&read.key, &call.args)?;
        Ok(match call.page {
            Some(page) if op.is_paginated() => paged_key(&key, page.current_page),
            _ => key,
        })
    }

    fn version_key(
        &self,
        op: &OperationDescriptor,
        template: &KeyTemplate,
        args: &BoundArgs,
        value: &Value,
    ) -> VersoResult<String> {
        Ok(match op.shape() {
            ResultShape::Collection => self.resolver.resolve(template, args)?,
            ResultShape::Single => self.resolver.resolve_with_result(template, value)?,
        })
    }

    async fn read_through(
        &self,
        op: &OperationDescriptor,
        read: &ReadThrough,
        call: &mut Call,
        backend: &dyn BackendExecutor,
    ) -> VersoResult<CacheRead<Option<Value>>> {
        let Some(store) = self.store_for(op) else {
            return self.bypass(op, read.key.text(), call, backend, "pool has no store").await;
        };

        let key = match self.cache_key(op, read, call) {
            Ok(key) => key,
            Err(e) => return self.bypass(op, read.key.text(), call, backend, &e.to_string()).await,
        };

        let compared = match self.probe(store.as_ref(), op, read, &key, call).await {
            Ok(Probe::Hit { value, version, total }) => {
                if let (Some(page), Some(total)) = (call.page.as_mut(), total) {
                    page.total = total;
                }
                Counters::bump(&self.counters.hits);
                tracing::debug!(operation = %op.id(), key = %key, version = %version, "cache hit");
                return Ok(CacheRead::hit(Some(value), version));
            }
            Ok(Probe::Miss { compared }) => compared,
            Err(e) => return self.bypass(op, read.key.text(), call, backend, &e.to_string()).await,
        };

        let loaded = self.load(op, read.key.text(), call, backend).await?;
        if loaded.shared {
            return Ok(CacheRead::with_outcome(loaded.value, ReadOutcome::Coalesced));
        }

        Counters::bump(&self.counters.misses);
        tracing::debug!(operation = %op.id(), key = %key, "cache miss");

        match self.recache(store.as_ref(), op, read, &key, compared, call, loaded.value.as_ref()).await {
            Ok(version) => Ok(CacheRead::miss(loaded.value, version)),
            Err(e) => {
                Counters::bump(&self.counters.bypasses);
                tracing::warn!(
                    operation = %op.id(),
                    store = %store.name(),
                    error = %e,
                    "failed to write result back to cache"
                );
                Ok(CacheRead::with_outcome(loaded.value, ReadOutcome::Bypass))
            }
        }
    }

    /// Look the entry up and decide hit or miss.
    async fn probe(
        &self,
        store: &dyn CacheStore,
        op: &OperationDescriptor,
        read: &ReadThrough,
        key: &str,
        call: &Call,
    ) -> VersoResult<Probe> {
        let Some(raw) = store.get(key).await? else {
            return Ok(Probe::Miss { compared: None });
        };
        let Some(entry) = CacheEntry::from_value(raw) else {
            tracing::debug!(key = %key, "cached value is not an entry, treating as miss");
            return Ok(Probe::Miss { compared: None });
        };

        let mut compared = None;
        if let Some(template) = &read.version_key {
            let version_key = self.version_key(op, template, &call.args, &entry.value)?;
            let current = VersionStamp::from_value(store.get(&version_key).await?.as_ref());
            let matched = current.matches(entry.version);
            if !matched {
                tracing::debug!(
                    key = %key,
                    version_key = %version_key,
                    cached = %entry.version,
                    current = %current,
                    "version mismatch"
                );
            }
            let comparison = Compared { version_key, current };
            if !matched {
                return Ok(Probe::Miss {
                    compared: Some(comparison),
                });
            }
            compared = Some(comparison);
        }

        let mut total = None;
        if Self::is_paged(op, call) {
            match store.get(&page_meta_key(key)).await?.and_then(PageMeta::from_value) {
                Some(meta) => total = Some(meta.total),
                None => {
                    tracing::debug!(key = %key, "page metadata missing, treating as miss");
                    return Ok(Probe::Miss { compared });
                }
            }
        }

        Ok(Probe::Hit {
            value: entry.value,
            version: entry.version,
            total,
        })
    }

    /// Stamp and store a fresh result. Returns the stamp it was stored under,
    /// or `None` when nothing was stored.
    #[allow(clippy::too_many_arguments)]
    async fn recache(
        &self,
        store: &dyn CacheStore,
        op: &OperationDescriptor,
        read: &ReadThrough,
        key: &str,
        compared: Option<Compared>,
        call: &Call,
        value: Option<&Value>,
    ) -> VersoResult<Option<VersionStamp>> {
        let Some(value) = value.filter(|v| !v.is_null()) else {
            tracing::debug!(operation = %op.id(), key = %key, "absent result is not cached");
            return Ok(None);
        };
        let ttl = self.ttl_for(op);

        let stamp = match &read.version_key {
            None => VersionStamp::NONE,
            Some(template) => {
                let (version_key, current) = match compared {
                    Some(Compared { version_key, current }) => (version_key, current),
                    None => {
                        let version_key = self.version_key(op, template, &call.args, value)?;
                        let current = VersionStamp::from_value(store.get(&version_key).await?.as_ref());
                        (version_key, current)
                    }
                };
                if current.is_valid() {
                    current
                } else {
                    self.mint(store, &version_key, ttl, true).await?
                }
            }
        };

        let entry = CacheEntry::new(value.clone(), stamp);
        add_with_optional_ttl(store, key, entry.to_value(), ttl).await?;

        if Self::is_paged(op, call) {
            let total = call.page.map(|p| p.total).unwrap_or_default();
            add_with_optional_ttl(store, &page_meta_key(key), PageMeta { total }.to_value(), ttl).await?;
        }

        tracing::debug!(operation = %op.id(), key = %key, version = %stamp, "cached result");
        Ok(Some(stamp))
    }

    /// Store a fresh stamp at `version_key`, strictly above the one it
    /// replaces.
    ///
    /// With `reread`, the key is read back once and a concurrent writer's
    /// stamp is adopted if one landed in between.
    async fn mint(
        &self,
        store: &dyn CacheStore,
        version_key: &str,
        ttl: Option<Duration>,
        reread: bool,
    ) -> VersoResult<VersionStamp> {
        let replaced = VersionStamp::from_value(store.get(version_key).await?.as_ref());
        let stamp = VersionStamp::mint_after(replaced);
        add_with_optional_ttl(store, version_key, stamp.to_value(), ttl).await?;
        Counters::bump(&self.counters.stamps_minted);
        tracing::debug!(version_key = %version_key, version = %stamp, "minted version stamp");

        if !reread {
            return Ok(stamp);
        }
        let landed = VersionStamp::from_value(store.get(version_key).await?.as_ref());
        Ok(if landed.is_valid() { landed } else { stamp })
    }

    /// Run the backend for a write, then evict and bump.
    async fn write_through(
        &self,
        op: &OperationDescriptor,
        maintenance: &Maintenance,
        call: &mut Call,
        backend: &dyn BackendExecutor,
    ) -> VersoResult<CacheRead<Option<Value>>> {
        let loaded = self.load(op, "", call, backend).await?;
        if loaded.shared {
            return Ok(CacheRead::with_outcome(loaded.value, ReadOutcome::Coalesced));
        }

        match self.store_for(op) {
            Some(store) => self.maintain(store.as_ref(), op, maintenance, &call.args).await,
            None => Counters::bump(&self.counters.bypasses),
        }
        Ok(CacheRead::with_outcome(loaded.value, ReadOutcome::PassThrough))
    }

    /// Every eviction and bump is attempted; failures are logged and skipped.
    async fn maintain(&self, store: &dyn CacheStore, op: &OperationDescriptor, maintenance: &Maintenance, args: &BoundArgs) {
        let ttl = self.ttl_for(op);
        let mut failed = false;

        for template in &maintenance.evict {
            let result = match self.resolver.resolve(template, args) {
                Ok(key) => store.delete(&key).await.map(|_| ()).map_err(VersoError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                failed = true;
                tracing::warn!(operation = %op.id(), template = %template, error = %e, "cache eviction failed");
            }
        }

        for template in &maintenance.bump {
            let result = match self.resolver.resolve(template, args) {
                Ok(version_key) => self.mint(store, &version_key, ttl, false).await.map(|_| ()),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                failed = true;
                tracing::warn!(operation = %op.id(), template = %template, error = %e, "version bump failed");
            }
        }

        if failed {
            Counters::bump(&self.counters.bypasses);
        }
    }

    /// Serve the call from the backend alone.
    async fn bypass(
        &self,
        op: &OperationDescriptor,
        template: &str,
        call: &mut Call,
        backend: &dyn BackendExecutor,
        reason: &str,
    ) -> VersoResult<CacheRead<Option<Value>>> {
        Counters::bump(&self.counters.bypasses);
        tracing::warn!(operation = %op.id(), reason = %reason, "cache path unavailable, calling backend directly");
        let loaded = self.load(op, template, call, backend).await?;
        Ok(CacheRead::with_outcome(loaded.value, ReadOutcome::Bypass))
    }

    /// Call the backend, through the coalescer when the operation asks for it.
    async fn load(
        &self,
        op: &OperationDescriptor,
        template: &str,
        call: &mut Call,
        backend: &dyn BackendExecutor,
    ) -> VersoResult<Loaded> {
        let Some(policy) = op.coalesce() else {
            let value = backend.execute(call).await?;
            return Ok(Loaded { value, shared: false });
        };

        let key = OperationKey::new(op.id(), template, &call.args, call.page_number());
        match self.coalescer.register(key) {
            Registration::Leader(leader) => {
                let executed = backend.execute(call).await;
                let total = call.page.map(|p| p.total);
                let outcome = executed.map(|value| BackendOutcome { value, total });
                leader.complete(&outcome);
                outcome.map(|o| Loaded {
                    value: o.value,
                    shared: false,
                })
            }
            Registration::Follower(waiter) => {
                let timeout = policy.timeout.or(self.config.coalesce_timeout);
                let outcome = waiter.wait(timeout).await??;
                if let (Some(page), Some(total)) = (call.page.as_mut(), outcome.total) {
                    page.total = total;
                }
                Counters::bump(&self.counters.coalesced);
                Ok(Loaded {
                    value: outcome.value,
                    shared: true,
                })
            }
        }
    }
}

impl std::fmt::Debug for VersionedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedCache")
            .field("manager", &self.manager)
            .field("operations", &self.registry.ids())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
