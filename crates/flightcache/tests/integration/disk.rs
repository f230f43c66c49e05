use std::time::Duration;

use flightcache::{BackendKind, CacheKey, DiskStorage, Storage, Submission};

use crate::{CountingProducer, Recipe, RecipeCoordinator, disk_path, recipe, setup_coordinator};

#[test]
fn test_restart_round_trip() {
    flightcache_test::setup();
    let cache_dir = flightcache_test::tempdir();

    let storage = DiskStorage::new(cache_dir.path()).unwrap();
    storage.put(CacheKey::new("52772"), recipe("teriyaki"));
    storage.put(CacheKey::new("404"), Recipe::Unavailable);
    let path = storage.keep();

    // a new instance on the same directory sees all the entries
    let storage = DiskStorage::<Recipe>::open(&path).unwrap();
    assert_eq!(
        storage.get(&CacheKey::new("52772")),
        Some(recipe("teriyaki"))
    );
    assert_eq!(storage.get(&CacheKey::new("404")), Some(Recipe::Unavailable));
    assert_eq!(storage.get(&CacheKey::new("52773")), None);

    let mut keys: Vec<_> = storage
        .keys()
        .iter()
        .map(|key| key.identifier().to_owned())
        .collect();
    keys.sort();
    assert_eq!(keys, ["404", "52772"]);
}

#[tokio::test]
async fn test_teardown_removes_directory() {
    let (coordinator, _stream, cache_dir) = setup_coordinator(BackendKind::Disk);
    let path = disk_path(&coordinator);
    assert_eq!(path.parent(), Some(cache_dir.path()));

    let key = CacheKey::new("52772");
    let producer = CountingProducer::new();
    coordinator
        .submit(key.clone(), producer.produce(recipe("teriyaki")))
        .await;
    assert!(path.join(key.cache_path()).is_file());

    drop(coordinator);
    assert!(!path.exists());
    assert!(cache_dir.path().is_dir());
}

#[tokio::test]
async fn test_close_keeps_directory_until_last_handle() {
    let (coordinator, mut stream, _cache_dir) = setup_coordinator(BackendKind::Disk);
    let path = disk_path(&coordinator);
    let key = CacheKey::new("52772");
    let producer = CountingProducer::new();
    coordinator
        .submit(key.clone(), producer.produce(recipe("teriyaki")))
        .await;

    coordinator.close();
    assert!(path.join(key.cache_path()).is_file());
    assert_eq!(coordinator.storage().get(&key), Some(recipe("teriyaki")));
    assert_eq!(
        stream.next_completion().await,
        Some((key.clone(), recipe("teriyaki")))
    );
    assert_eq!(stream.next_completion().await, None);

    drop(coordinator);
    assert!(!path.exists());
}

#[tokio::test(start_paused = true)]
async fn test_teardown_waits_for_running_computations() {
    let (coordinator, mut stream, _cache_dir) = setup_coordinator(BackendKind::Disk);
    let path = disk_path(&coordinator);

    let producer = CountingProducer::with_delay(Duration::from_millis(100));
    let handle = coordinator.spawn(CacheKey::new("52772"), producer.produce(recipe("teriyaki")));

    // the spawned task keeps the coordinator alive
    drop(coordinator);
    assert!(path.is_dir());

    assert_eq!(handle.await.unwrap(), Submission::Computed);
    assert_eq!(
        stream.next_completion().await,
        Some((CacheKey::new("52772"), recipe("teriyaki")))
    );
    assert_eq!(stream.next_completion().await, None);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_flush_uses_new_directory() {
    let (coordinator, _stream, cache_dir) = setup_coordinator(BackendKind::Disk);
    let old_path = disk_path(&coordinator);

    let (flushed, _flushed_stream) = coordinator.flushed();
    let new_path = disk_path(&flushed);
    assert_ne!(old_path, new_path);
    assert_eq!(new_path.parent(), Some(cache_dir.path()));

    drop(coordinator);
    assert!(!old_path.exists());
    assert!(new_path.is_dir());

    drop(flushed);
    assert!(!new_path.exists());
}

#[tokio::test]
async fn test_unusable_cache_dir_falls_back_to_memory() {
    flightcache_test::setup();
    let cache_dir = flightcache_test::tempdir();
    let blocker = cache_dir.path().join("not-a-directory");
    std::fs::write(&blocker, b"").unwrap();

    let config = flightcache::Config {
        cache: flightcache::config::CacheConfig {
            backend: BackendKind::Disk,
            cache_dir: Some(blocker),
            ..Default::default()
        },
        ..Default::default()
    };
    let (coordinator, mut stream) = RecipeCoordinator::from_config(&config);
    assert_eq!(coordinator.storage().kind(), BackendKind::Memory);

    let key = CacheKey::new("52772");
    let producer = CountingProducer::new();
    coordinator
        .submit(key.clone(), producer.produce(recipe("teriyaki")))
        .await;
    assert_eq!(stream.try_next_completion(), Some((key, recipe("teriyaki"))));
}
