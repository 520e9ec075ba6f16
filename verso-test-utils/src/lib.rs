//! VERSO Test Utilities
//!
//! Shared test infrastructure for the VERSO workspace:
//! - Controllable cache stores and backends
//! - Proptest generators for templates and arguments
//! - Fixtures for the photo/album scenario used across the tests
//! - Assertions for VERSO error variants

pub use verso_core::{
    BoundArgs, CacheEntry, CacheError, CoalesceError, ConfigError, KeyTemplate, PageDescriptor,
    TemplateError, VersionStamp, VersoConfig, VersoError, VersoResult,
};
pub use verso_storage::{
    BackendExecutor, CacheManager, CacheStore, Call, MemoryCacheStore, MultiLevelCache,
    OperationBuilder, ReadOutcome, VersionedCache,
};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Install a fmt subscriber filtered by `RUST_LOG`. Safe to call from every
/// test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MOCK STORES
// ============================================================================

/// Wraps a store and can be switched offline, counting every call.
///
/// Offline, every operation fails with `CacheError::Unreachable`.
pub struct SwitchableStore {
    name: String,
    inner: Arc<dyn CacheStore>,
    online: AtomicBool,
    calls: AtomicUsize,
}

impl SwitchableStore {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::wrapping(name.clone(), Arc::new(MemoryCacheStore::new(name)))
    }

    pub fn wrapping(name: impl Into<String>, inner: Arc<dyn CacheStore>) -> Self {
        Self {
            name: name.into(),
            inner,
            online: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    /// Start offline.
    pub fn offline(self) -> Self {
        self.set_online(false);
        self
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Calls received, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    /// The wrapped store, bypassing the switch.
    pub fn inner(&self) -> &Arc<dyn CacheStore> {
        &self.inner
    }

    fn check(&self) -> Result<(), CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.is_online() {
            Ok(())
        } else {
            Err(CacheError::unreachable(&self.name, "switched offline"))
        }
    }
}

#[async_trait]
impl CacheStore for SwitchableStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, key: &str, value: Value) -> Result<(), CacheError> {
        self.check()?;
        self.inner.add(key, value).await
    }

    async fn add_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.inner.add_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn remove_all(&self) -> Result<(), CacheError> {
        self.check()?;
        self.inner.remove_all().await
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn key_exists(&self, key: &str) -> Result<bool, CacheError> {
        self.check()?;
        self.inner.key_exists(key).await
    }
}

// ============================================================================
// MOCK BACKENDS
// ============================================================================

type Responder = dyn Fn(&Call, usize) -> VersoResult<Option<Value>> + Send + Sync;

/// Backend that counts executions and answers from a closure.
///
/// The closure receives the call and the 1-based execution number.
pub struct CountingBackend {
    calls: AtomicUsize,
    delay: Option<Duration>,
    total: u64,
    respond: Box<Responder>,
}

impl CountingBackend {
    pub fn with_fn<F>(respond: F) -> Self
    where
        F: Fn(&Call, usize) -> VersoResult<Option<Value>> + Send + Sync + 'static,
    {
        Self {
            calls: AtomicUsize::new(0),
            delay: None,
            total: 0,
            respond: Box::new(respond),
        }
    }

    /// Always returns `value`.
    pub fn returning(value: Value) -> Self {
        Self::with_fn(move |_, _| Ok(Some(value.clone())))
    }

    /// Always reports no result.
    pub fn absent() -> Self {
        Self::with_fn(|_, _| Ok(None))
    }

    /// Always fails with a backend error.
    pub fn failing(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::with_fn(move |_, _| Err(verso_core::BackendError::new("mock", &reason).into()))
    }

    /// Sleep before answering, to widen concurrency windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Total written into the call's page descriptor.
    pub fn with_total(mut self, total: u64) -> Self {
        self.total = total;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendExecutor for CountingBackend {
    async fn execute(&self, call: &mut Call) -> VersoResult<Option<Value>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(page) = call.page.as_mut() {
            page.total = self.total;
        }
        (self.respond)(call, n)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for templates and arguments.

    use proptest::prelude::*;
    use serde_json::{json, Value};

    use super::fixtures::Photo;

    /// A placeholder identifier that is not the reserved `result`.
    pub fn arb_identifier() -> impl Strategy<Value = String> {
        "[a-zA-Z_][a-zA-Z0-9_]{0,12}".prop_filter("reserved", |s| s != "result")
    }

    /// Literal template text with no sigil and no positional braces.
    pub fn arb_literal() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_-]{0,10}"
    }

    /// A scalar argument value that resolves to a non-empty key fragment.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            "[a-z0-9]{1,8}".prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
        ]
    }

    /// A `literal:ident` template with its placeholder name.
    pub fn arb_simple_template() -> impl Strategy<Value = (String, String)> {
        (arb_literal(), arb_identifier()).prop_map(|(lit, ident)| (format!("{}:{}", lit, ident), ident))
    }

    pub fn arb_photo() -> impl Strategy<Value = Photo> {
        (1i64..10_000, 1i64..100, "[a-z ]{0,16}").prop_map(|(id, album_id, title)| Photo {
            id,
            album_id,
            title,
        })
    }

    /// Page numbers, including 0 which clamps to 1.
    pub fn arb_page() -> impl Strategy<Value = u32> {
        0u32..50
    }

    /// An array argument of `len` distinct integers.
    pub fn arb_id_batch(len: usize) -> impl Strategy<Value = Value> {
        proptest::collection::hash_set(1i64..1_000_000, len).prop_map(|ids| json!(ids.into_iter().collect::<Vec<_>>()))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! The photo/album scenario.

    use super::*;
    use serde::{Deserialize, Serialize};

    /// A photo belonging to an album.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Photo {
        pub id: i64,
        #[serde(rename = "albumId")]
        pub album_id: i64,
        pub title: String,
    }

    impl Photo {
        pub fn new(id: i64, album_id: i64, title: impl Into<String>) -> Self {
            Self {
                id,
                album_id,
                title: title.into(),
            }
        }

        pub fn to_value(&self) -> Value {
            serde_json::json!({ "id": self.id, "albumId": self.album_id, "title": self.title })
        }
    }

    pub const PHOTO_GET: &str = "photo.get";
    pub const PHOTO_LIST: &str = "photo.list";
    pub const PHOTO_SAVE: &str = "photo.save";

    /// Single photo by id, versioned by its album.
    pub fn photo_get() -> OperationBuilder {
        OperationBuilder::new(PHOTO_GET)
            .single()
            .param("id")
            .read_through("photo-:id")
            .version_key("PHOTO-:result.albumId-v")
    }

    /// Paginated photos of an album, versioned by the album.
    pub fn photo_list() -> OperationBuilder {
        OperationBuilder::new(PHOTO_LIST)
            .collection()
            .paginated()
            .param("albumId")
            .read_through("photo-l-d-album:albumId")
            .version_key("PHOTO-:albumId-v")
    }

    /// Saving a photo evicts its entry and bumps its album's version.
    pub fn photo_save() -> OperationBuilder {
        OperationBuilder::new(PHOTO_SAVE)
            .param("id")
            .param("albumId")
            .evict("photo-:id")
            .bump("PHOTO-:albumId-v")
    }

    pub fn id_args(id: i64) -> BoundArgs {
        BoundArgs::new()
            .bind("id", id)
            .unwrap_or_default()
    }

    pub fn album_args(album_id: i64) -> BoundArgs {
        BoundArgs::new()
            .bind("albumId", album_id)
            .unwrap_or_default()
    }

    /// A memory store registered as the default pool.
    pub fn memory_manager() -> (Arc<CacheManager>, Arc<MemoryCacheStore>) {
        let store = Arc::new(MemoryCacheStore::new("near"));
        let manager = CacheManager::new().with_default(store.clone());
        (Arc::new(manager), store)
    }

    /// A versioned cache over a fresh memory store.
    pub fn memory_cache() -> (VersionedCache, Arc<MemoryCacheStore>) {
        let (manager, store) = memory_manager();
        (VersionedCache::new(manager, VersoConfig::default()), store)
    }

    /// A versioned cache over a switchable store.
    pub fn switchable_cache() -> (VersionedCache, Arc<SwitchableStore>) {
        let store = Arc::new(SwitchableStore::new("switchable"));
        let manager = CacheManager::new().with_default(store.clone());
        (VersionedCache::new(Arc::new(manager), VersoConfig::default()), store)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for VERSO error variants.

    use super::*;

    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &VersoResult<T>) {
        match result {
            Err(VersoError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_coalesce_incomplete<T: std::fmt::Debug>(result: &VersoResult<T>) {
        match result {
            Err(VersoError::Coalesce(CoalesceError::Incomplete { .. })) => {}
            other => panic!("Expected incomplete coalesced call, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_backend_error<T: std::fmt::Debug>(result: &VersoResult<T>) {
        match result {
            Err(VersoError::Backend(_)) => {}
            other => panic!("Expected Backend error, got: {:?}", other),
        }
    }

    /// Decode the entry stored at `key` in `store`.
    pub async fn stored_entry(store: &dyn CacheStore, key: &str) -> Option<CacheEntry> {
        store.get(key).await.ok().flatten().and_then(CacheEntry::from_value)
    }

    /// Read the stamp stored at a version key.
    pub async fn stored_stamp(store: &dyn CacheStore, version_key: &str) -> VersionStamp {
        VersionStamp::from_value(store.get(version_key).await.ok().flatten().as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_switchable_store_goes_offline() {
        let store = SwitchableStore::new("far");
        store.add("k", json!(1)).await.unwrap();
        store.set_online(false);
        assert!(matches!(store.get("k").await, Err(CacheError::Unreachable { .. })));
        store.set_online(true);
        assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn test_counting_backend_counts_and_sets_total() {
        let backend = CountingBackend::with_fn(|_, n| Ok(Some(json!(n)))).with_total(42);
        let mut call = Call::new(album_args(1)).with_page(PageDescriptor::new(1, 10));
        assert_eq!(backend.execute(&mut call).await.unwrap(), Some(json!(1)));
        assert_eq!(backend.execute(&mut call).await.unwrap(), Some(json!(2)));
        assert_eq!(call.page.unwrap().total, 42);
        assert_eq!(backend.calls(), 2);
    }

    #[test]
    fn test_fixture_operations_build() {
        photo_get().build().unwrap();
        photo_list().build().unwrap();
        photo_save().build().unwrap();
    }

    #[test]
    fn test_photo_value_uses_album_id_field() {
        let photo = Photo::new(3, 7, "beach");
        assert_eq!(photo.to_value()["albumId"], json!(7));
        assert_eq!(serde_json::to_value(&photo).unwrap(), photo.to_value());
    }

    proptest! {
        #[test]
        fn prop_identifiers_never_reserved(ident in generators::arb_identifier()) {
            prop_assert_ne!(ident, "result");
        }

        #[test]
        fn prop_photo_round_trips_through_value(photo in generators::arb_photo()) {
            let back: Photo = serde_json::from_value(photo.to_value()).unwrap();
            prop_assert_eq!(back, photo);
        }
    }
}
