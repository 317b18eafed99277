use bytes::Bytes;
use streamload_service::caching::MemoryPressure;
use streamload_service::intention::CacheKey;

use crate::{TempDir, TestLoader, drive, setup_disk_cached_orchestrator, setup_orchestrator};

#[tokio::test]
async fn test_unload_released_assets() {
    let mut orchestrator = setup_orchestrator(TestLoader::new(), |_| {});

    let keys: Vec<_> = (0..10).map(|i| CacheKey::new(format!("mesh:{i}"))).collect();
    let promises: Vec<_> = keys
        .iter()
        .map(|key| {
            let intention = orchestrator.intention(key.clone(), ());
            orchestrator.submit(intention)
        })
        .collect();
    drive(&mut orchestrator).await;
    for promise in promises {
        assert!(matches!(promise.resolved().await, Some(Ok(_))));
    }
    assert_eq!(orchestrator.cache().len(), 10);

    let cache = orchestrator.cache();
    for key in &keys[..5] {
        assert_eq!(cache.release(key), Some(0));
    }

    assert_eq!(cache.unload(MemoryPressure::Full, 100), 5);
    assert_eq!(cache.len(), 5);
    for key in &keys[..5] {
        assert_eq!(cache.ref_count(key), None);
    }
    for key in &keys[5..] {
        assert_eq!(cache.ref_count(key), Some(1));
    }
}

#[tokio::test]
async fn test_evicted_asset_is_fetched_again() {
    let mut orchestrator = setup_orchestrator(TestLoader::new(), |_| {});
    let key = CacheKey::new("scene:9");

    let intention = orchestrator.intention(key.clone(), ());
    let first = orchestrator.submit(intention);
    drive(&mut orchestrator).await;
    assert!(matches!(first.resolved().await, Some(Ok(_))));

    orchestrator.cache().release(&key);
    assert_eq!(orchestrator.cache().unload(MemoryPressure::Warning, 1), 1);

    let intention = orchestrator.intention(key.clone(), ());
    let second = orchestrator.submit(intention);
    drive(&mut orchestrator).await;
    assert_eq!(second.resolved().await, Some(Ok("scene:9".to_owned())));
    assert_eq!(orchestrator.loader().fetches("scene:9"), 2);
    assert_eq!(orchestrator.cache().ref_count(&key), Some(1));
}

#[tokio::test]
async fn test_disk_cache_written_after_fetch() {
    let root = TempDir::new().unwrap();
    let mut orchestrator = setup_disk_cached_orchestrator(TestLoader::new(), root.path());
    let key = CacheKey::new("scene:1");

    let intention = orchestrator.intention(key.clone(), ());
    let promise = orchestrator.submit(intention);
    drive(&mut orchestrator).await;
    assert_eq!(promise.resolved().await, Some(Ok("scene:1".to_owned())));

    let disk = orchestrator.cache().disk_cache().unwrap();
    assert_eq!(
        disk.get(&key).unwrap(),
        Some(Bytes::from_static(b"scene:1"))
    );
}

#[tokio::test]
async fn test_disk_hit_after_unload() {
    let root = TempDir::new().unwrap();
    let mut orchestrator = setup_disk_cached_orchestrator(TestLoader::new(), root.path());
    let key = CacheKey::new("scene:2");

    let intention = orchestrator.intention(key.clone(), ());
    let first = orchestrator.submit(intention);
    drive(&mut orchestrator).await;
    assert!(matches!(first.resolved().await, Some(Ok(_))));

    orchestrator.cache().release(&key);
    assert_eq!(orchestrator.cache().unload(MemoryPressure::Full, 10), 1);
    assert_eq!(orchestrator.cache().ref_count(&key), None);

    let intention = orchestrator.intention(key.clone(), ());
    let second = orchestrator.submit(intention);
    drive(&mut orchestrator).await;

    assert_eq!(second.resolved().await, Some(Ok("scene:2".to_owned())));
    assert_eq!(orchestrator.loader().fetches("scene:2"), 1);
    assert_eq!(orchestrator.cache().ref_count(&key), Some(1));
    assert_eq!(orchestrator.admission().in_flight(), 0);
}

#[tokio::test]
async fn test_disk_cache_outlives_memory_cache() {
    let root = TempDir::new().unwrap();
    let key = CacheKey::new("scene:3");

    let mut orchestrator = setup_disk_cached_orchestrator(TestLoader::new(), root.path());
    let intention = orchestrator.intention(key.clone(), ());
    let promise = orchestrator.submit(intention);
    drive(&mut orchestrator).await;
    assert!(matches!(promise.resolved().await, Some(Ok(_))));
    drop(orchestrator);

    let mut orchestrator = setup_disk_cached_orchestrator(TestLoader::new(), root.path());
    let intention = orchestrator.intention(key.clone(), ());
    let promise = orchestrator.submit(intention);
    drive(&mut orchestrator).await;

    assert_eq!(promise.resolved().await, Some(Ok("scene:3".to_owned())));
    assert_eq!(orchestrator.loader().total_fetches(), 0);
}

#[tokio::test]
async fn test_unqualified_intentions_skip_disk() {
    let root = TempDir::new().unwrap();
    let loader = TestLoader::new().without_disk_cache();
    let mut orchestrator = setup_disk_cached_orchestrator(loader, root.path());
    let key = CacheKey::new("scene:4");

    let intention = orchestrator.intention(key.clone(), ());
    let first = orchestrator.submit(intention);
    drive(&mut orchestrator).await;
    assert!(matches!(first.resolved().await, Some(Ok(_))));

    let disk = orchestrator.cache().disk_cache().unwrap();
    assert_eq!(disk.get(&key).unwrap(), None);

    orchestrator.cache().release(&key);
    orchestrator.cache().unload(MemoryPressure::Full, 10);

    let intention = orchestrator.intention(key.clone(), ());
    let second = orchestrator.submit(intention);
    drive(&mut orchestrator).await;
    assert!(matches!(second.resolved().await, Some(Ok(_))));
    assert_eq!(orchestrator.loader().fetches("scene:4"), 2);
}
