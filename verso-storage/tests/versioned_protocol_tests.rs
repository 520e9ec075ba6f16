use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use verso_core::{page_meta_key, CacheEntry, PageDescriptor, VersionStamp};
use verso_storage::{CacheStore, Call, OperationBuilder, ReadOutcome};
use verso_test_utils::assertions::{assert_backend_error, stored_entry, stored_stamp};
use verso_test_utils::fixtures::*;
use verso_test_utils::{init_test_tracing, CountingBackend};

#[tokio::test]
async fn version_match_is_a_hit() {
    init_test_tracing();
    let (cache, store) = memory_cache();
    cache.register(photo_get().build().unwrap()).unwrap();

    let cached = Photo::new(5, 7, "cached");
    let stamp = VersionStamp::new(1_700_000_000_123);
    store
        .add("photo-5", CacheEntry::new(cached.to_value(), stamp).to_value())
        .await
        .unwrap();
    store.add("PHOTO-7-v", stamp.to_value()).await.unwrap();

    let backend = CountingBackend::returning(Photo::new(5, 7, "fresh").to_value());
    let read = cache
        .invoke_traced(PHOTO_GET, &mut Call::new(id_args(5)), &backend)
        .await
        .unwrap();

    assert!(read.was_cache_hit());
    assert_eq!(read.version(), Some(stamp));
    assert_eq!(read.into_value(), Some(cached.to_value()));
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn version_mismatch_reuses_current_stamp() {
    let (cache, store) = memory_cache();
    cache.register(photo_get().build().unwrap()).unwrap();

    let stale = VersionStamp::new(100);
    let current = VersionStamp::new(200);
    store
        .add("photo-5", CacheEntry::new(Photo::new(5, 7, "old").to_value(), stale).to_value())
        .await
        .unwrap();
    store.add("PHOTO-7-v", current.to_value()).await.unwrap();

    let fresh = Photo::new(5, 7, "fresh");
    let backend = CountingBackend::returning(fresh.to_value());
    let value = cache
        .invoke(PHOTO_GET, &mut Call::new(id_args(5)), &backend)
        .await
        .unwrap();

    assert_eq!(value, Some(fresh.to_value()));
    assert_eq!(backend.calls(), 1);
    let entry = stored_entry(store.as_ref(), "photo-5").await.unwrap();
    assert_eq!(entry.value, fresh.to_value());
    assert_eq!(entry.version, current);
    assert_eq!(cache.stats().stamps_minted, 0);
}

#[tokio::test]
async fn missing_version_key_mints_a_new_stamp() {
    let (cache, store) = memory_cache();
    cache.register(photo_get().build().unwrap()).unwrap();

    store
        .add(
            "photo-5",
            CacheEntry::new(Photo::new(5, 7, "old").to_value(), VersionStamp::new(100)).to_value(),
        )
        .await
        .unwrap();

    let backend = CountingBackend::returning(Photo::new(5, 7, "fresh").to_value());
    cache
        .invoke(PHOTO_GET, &mut Call::new(id_args(5)), &backend)
        .await
        .unwrap();

    assert_eq!(backend.calls(), 1);
    let minted = stored_stamp(store.as_ref(), "PHOTO-7-v").await;
    assert!(minted.is_valid());
    assert_ne!(minted, VersionStamp::new(100));
    let entry = stored_entry(store.as_ref(), "photo-5").await.unwrap();
    assert_eq!(entry.version, minted);
}

#[tokio::test]
async fn single_object_version_key_binds_result() {
    let (cache, store) = memory_cache();
    cache.register(photo_get().build().unwrap()).unwrap();
    let backend = CountingBackend::returning(Photo::new(3, 7, "beach").to_value());

    let first = cache
        .invoke_traced(PHOTO_GET, &mut Call::new(id_args(3)), &backend)
        .await
        .unwrap();
    assert_eq!(first.outcome(), ReadOutcome::Miss);

    let stamp = stored_stamp(store.as_ref(), "PHOTO-7-v").await;
    assert!(stamp.is_valid());
    assert_eq!(first.version(), Some(stamp));

    let second = cache
        .invoke_traced(PHOTO_GET, &mut Call::new(id_args(3)), &backend)
        .await
        .unwrap();
    assert!(second.was_cache_hit());
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn paginated_keys_carry_page_suffix_and_metadata() {
    let (cache, store) = memory_cache();
    cache.register(photo_list().build().unwrap()).unwrap();
    let rows = json!([{"id": 11}, {"id": 12}]);
    let backend = CountingBackend::returning(rows.clone()).with_total(42);

    let mut call = Call::new(album_args(1)).with_page(PageDescriptor::new(2, 10));
    cache.invoke(PHOTO_LIST, &mut call, &backend).await.unwrap();
    assert_eq!(call.page.unwrap().total, 42);

    assert!(store.key_exists("photo-l-d-album1-p2").await.unwrap());
    assert_eq!(
        store.get("page-photo-l-d-album1-p2").await.unwrap(),
        Some(json!({"total": 42}))
    );
    assert!(!store.key_exists("photo-l-d-album1").await.unwrap());

    // A hit copies the stored total into the caller's descriptor.
    let mut again = Call::new(album_args(1)).with_page(PageDescriptor::new(2, 10));
    let value = cache.invoke(PHOTO_LIST, &mut again, &backend).await.unwrap();
    assert_eq!(value, Some(rows));
    assert_eq!(again.page.unwrap().total, 42);
    assert_eq!(backend.calls(), 1);

    // Other pages are separate entries.
    let mut page_three = Call::new(album_args(1)).with_page(PageDescriptor::new(3, 10));
    cache.invoke(PHOTO_LIST, &mut page_three, &backend).await.unwrap();
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn missing_page_metadata_downgrades_to_miss() {
    let (cache, store) = memory_cache();
    cache.register(photo_list().build().unwrap()).unwrap();
    let backend = CountingBackend::returning(json!([])).with_total(0);

    let call = || Call::new(album_args(1)).with_page(PageDescriptor::new(1, 10));
    cache.invoke(PHOTO_LIST, &mut call(), &backend).await.unwrap();
    cache.invoke(PHOTO_LIST, &mut call(), &backend).await.unwrap();
    assert_eq!(backend.calls(), 1);

    store.delete(&page_meta_key("photo-l-d-album1-p1")).await.unwrap();
    let read = cache
        .invoke_traced(PHOTO_LIST, &mut call(), &backend)
        .await
        .unwrap();
    assert_eq!(read.outcome(), ReadOutcome::Miss);
    assert_eq!(backend.calls(), 2);
    assert!(store.key_exists("page-photo-l-d-album1-p1").await.unwrap());
}

#[tokio::test]
async fn maintenance_evicts_and_bumps_after_success() {
    let (cache, store) = memory_cache();
    cache
        .register(
            OperationBuilder::new("photo.move")
                .param("id")
                .param("albumId")
                .evict("photo-:id")
                .evict("album-:albumId")
                .bump("PHOTO-:albumId-v")
                .bump("ALBUM-:albumId-v")
                .build()
                .unwrap(),
        )
        .unwrap();

    for key in ["photo-5", "album-7"] {
        store.add(key, json!("cached")).await.unwrap();
    }
    for key in ["PHOTO-7-v", "ALBUM-7-v"] {
        store.add(key, json!(1)).await.unwrap();
    }

    let args = id_args(5).bind("albumId", 7).unwrap();
    let backend = CountingBackend::returning(json!(true));
    cache
        .invoke("photo.move", &mut Call::new(args), &backend)
        .await
        .unwrap();

    assert!(!store.key_exists("photo-5").await.unwrap());
    assert!(!store.key_exists("album-7").await.unwrap());
    assert!(stored_stamp(store.as_ref(), "PHOTO-7-v").await.as_i64() > 1);
    assert!(stored_stamp(store.as_ref(), "ALBUM-7-v").await.as_i64() > 1);
    assert_eq!(cache.stats().stamps_minted, 2);
}

#[tokio::test]
async fn failed_write_skips_maintenance() {
    let (cache, store) = memory_cache();
    cache.register(photo_save().build().unwrap()).unwrap();
    store.add("photo-5", json!("cached")).await.unwrap();
    store.add("PHOTO-7-v", json!(1)).await.unwrap();

    let backend = CountingBackend::failing("constraint violation");
    let args = id_args(5).bind("albumId", 7).unwrap();
    let result = cache.invoke(PHOTO_SAVE, &mut Call::new(args), &backend).await;

    assert_backend_error(&result);
    assert!(store.key_exists("photo-5").await.unwrap());
    assert_eq!(stored_stamp(store.as_ref(), "PHOTO-7-v").await, VersionStamp::new(1));
}

#[tokio::test]
async fn version_bump_invalidates_collection_reads() {
    let (cache, _store) = memory_cache();
    cache.register(photo_list().build().unwrap()).unwrap();
    cache.register(photo_save().build().unwrap()).unwrap();
    let lister = CountingBackend::returning(json!([{"id": 5}]));
    let saver = CountingBackend::returning(json!(true));

    let list = || Call::new(album_args(7)).with_page(PageDescriptor::new(1, 20));
    cache.invoke(PHOTO_LIST, &mut list(), &lister).await.unwrap();
    cache.invoke(PHOTO_LIST, &mut list(), &lister).await.unwrap();
    assert_eq!(lister.calls(), 1);

    let args = id_args(5).bind("albumId", 7).unwrap();
    cache.invoke(PHOTO_SAVE, &mut Call::new(args), &saver).await.unwrap();

    let read = cache.invoke_traced(PHOTO_LIST, &mut list(), &lister).await.unwrap();
    assert_eq!(read.outcome(), ReadOutcome::Miss);
    assert_eq!(lister.calls(), 2);
}

#[tokio::test]
async fn back_to_back_bumps_never_reuse_a_stamp() {
    for _ in 0..200 {
        let (cache, store) = memory_cache();
        cache.register(photo_list().build().unwrap()).unwrap();
        cache.register(photo_save().build().unwrap()).unwrap();
        let lister = CountingBackend::returning(json!([{"id": 5}]));
        let saver = CountingBackend::returning(json!(true));
        let list = || Call::new(album_args(7)).with_page(PageDescriptor::new(1, 20));

        cache.invoke(PHOTO_LIST, &mut list(), &lister).await.unwrap();
        let before = stored_stamp(store.as_ref(), "PHOTO-7-v").await;
        let args = id_args(5).bind("albumId", 7).unwrap();
        cache.invoke(PHOTO_SAVE, &mut Call::new(args), &saver).await.unwrap();
        let after = stored_stamp(store.as_ref(), "PHOTO-7-v").await;
        assert!(after.as_i64() > before.as_i64());

        let read = cache.invoke_traced(PHOTO_LIST, &mut list(), &lister).await.unwrap();
        assert_eq!(read.outcome(), ReadOutcome::Miss);
        assert_eq!(lister.calls(), 2);
    }
}

#[tokio::test]
async fn bump_moves_past_a_stamp_from_the_future() {
    let (cache, store) = memory_cache();
    cache.register(photo_save().build().unwrap()).unwrap();
    let ahead = VersionStamp::new(chrono::Utc::now().timestamp_millis() + 3_600_000);
    store.add("PHOTO-7-v", ahead.to_value()).await.unwrap();

    let args = id_args(5).bind("albumId", 7).unwrap();
    cache
        .invoke(PHOTO_SAVE, &mut Call::new(args), &CountingBackend::returning(json!(true)))
        .await
        .unwrap();

    let bumped = stored_stamp(store.as_ref(), "PHOTO-7-v").await;
    assert!(bumped.as_i64() > ahead.as_i64());
}

#[tokio::test]
async fn unreachable_cache_bypasses_to_backend_once() {
    init_test_tracing();
    let (cache, store) = switchable_cache();
    cache.register(photo_get().build().unwrap()).unwrap();
    store.set_online(false);

    let photo = Photo::new(1, 2, "offline");
    let backend = CountingBackend::returning(photo.to_value());
    let read = cache
        .invoke_traced(PHOTO_GET, &mut Call::new(id_args(1)), &backend)
        .await
        .unwrap();

    assert_eq!(read.outcome(), ReadOutcome::Bypass);
    assert_eq!(read.into_value(), Some(photo.to_value()));
    assert_eq!(backend.calls(), 1);
    assert_eq!(store.calls(), 1);
    assert_eq!(cache.stats().bypasses, 1);
}

#[tokio::test]
async fn backend_errors_surface_on_read() {
    let (cache, store) = memory_cache();
    cache.register(photo_get().build().unwrap()).unwrap();
    let backend = CountingBackend::failing("connection reset");

    let result = cache.invoke(PHOTO_GET, &mut Call::new(id_args(1)), &backend).await;
    assert_backend_error(&result);
    assert!(store.is_empty());
}

#[tokio::test]
async fn ttl_expires_cached_entries() {
    let (cache, _store) = memory_cache();
    cache
        .register(photo_get().ttl(Duration::from_millis(30)).build().unwrap())
        .unwrap();
    let backend = CountingBackend::returning(Photo::new(1, 2, "t").to_value());

    cache.invoke(PHOTO_GET, &mut Call::new(id_args(1)), &backend).await.unwrap();
    cache.invoke(PHOTO_GET, &mut Call::new(id_args(1)), &backend).await.unwrap();
    assert_eq!(backend.calls(), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    cache.invoke(PHOTO_GET, &mut Call::new(id_args(1)), &backend).await.unwrap();
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn pools_are_isolated() {
    let photos = Arc::new(verso_storage::MemoryCacheStore::new("photos"));
    let albums = Arc::new(verso_storage::MemoryCacheStore::new("albums"));
    let manager = verso_storage::CacheManager::new()
        .with_pool("Photos", photos.clone())
        .with_pool("albums", albums.clone());
    let cache = verso_storage::VersionedCache::new(Arc::new(manager), verso_core::VersoConfig::default());
    cache
        .register(photo_get().pool("PHOTOS").build().unwrap())
        .unwrap();

    let backend = CountingBackend::returning(Photo::new(1, 2, "p").to_value());
    cache.invoke(PHOTO_GET, &mut Call::new(id_args(1)), &backend).await.unwrap();

    assert!(photos.key_exists("photo-1").await.unwrap());
    assert!(albums.is_empty());
}

#[tokio::test]
async fn renamed_default_pool_serves_operations_without_a_pool() {
    let config = verso_core::VersoConfig::default().with_default_pool("Photos");
    let manager = verso_storage::CacheManager::from_config(&config).unwrap();
    let cache = verso_storage::VersionedCache::new(Arc::new(manager), config);
    cache.register(photo_get().build().unwrap()).unwrap();

    let backend = CountingBackend::returning(Photo::new(1, 2, "p").to_value());
    cache.invoke(PHOTO_GET, &mut Call::new(id_args(1)), &backend).await.unwrap();
    let read = cache
        .invoke_traced(PHOTO_GET, &mut Call::new(id_args(1)), &backend)
        .await
        .unwrap();
    assert!(read.was_cache_hit());

    let near = Arc::new(verso_storage::MemoryCacheStore::new("near"));
    let manager = verso_storage::CacheManager::new()
        .with_default_pool("albums")
        .with_default(near.clone());
    let cache = verso_storage::VersionedCache::new(Arc::new(manager), verso_core::VersoConfig::default());
    cache.register(photo_get().build().unwrap()).unwrap();
    cache.invoke(PHOTO_GET, &mut Call::new(id_args(3)), &backend).await.unwrap();
    assert!(near.key_exists("photo-3").await.unwrap());
}
