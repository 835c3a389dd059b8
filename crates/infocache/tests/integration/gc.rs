use infocache::{Cache, CacheConfig, LockManager, LockState};
use infocache_test::setup;

#[test]
fn test_oldest_unused_entry_is_evicted() {
    setup();

    let manager = LockManager::default();
    let cache: Cache<String, i32> = Cache::new(&manager, "example", CacheConfig { max_size: 2 });

    for key in ["a", "b", "c"] {
        let mut requestor = manager.requestor_at(0);
        let lock = cache.get_or_create_lock(&mut requestor, key.to_owned());
        let LockState::Locked(load) = manager.acquire_load_lock(&mut requestor, &lock, false)
        else {
            panic!("expected to get the load lock");
        };
        load.set_payload(key.len() as i32);
        manager.report_loaded(&mut requestor, load, 100);
    }

    assert!(!cache.contains(&"a".to_owned()));
    assert!(cache.contains(&"b".to_owned()));
    assert!(cache.contains(&"c".to_owned()));

    // "a" is recreated from scratch, the others are still loaded
    let mut requestor = manager.requestor_at(0);
    let a = cache.get_or_create_lock(&mut requestor, "a".to_owned());
    assert!(!a.is_loaded(&requestor));
    let b = cache.get_or_create_lock(&mut requestor, "b".to_owned());
    assert!(b.is_loaded(&requestor));
    assert!(matches!(
        manager.acquire_load_lock(&mut requestor, &b, false),
        LockState::AlreadyLoaded
    ));
}

#[test]
fn test_queue_stays_bounded() {
    setup();

    let manager = LockManager::default();
    let cache: Cache<u32, ()> = Cache::new(&manager, "bounded", CacheConfig { max_size: 5 });

    let mut pinned = manager.requestor();
    for key in 0..3 {
        let _lock = cache.get_or_create_lock(&mut pinned, key);
    }

    // overlapping units of work, releasing in a different order than they started
    let mut live = Vec::new();
    for key in 0..200 {
        let mut requestor = manager.requestor();
        let _lock = cache.get_or_create_lock(&mut requestor, key % 37);
        live.push(requestor);
        if live.len() == 4 {
            drop(live.swap_remove(key as usize % 4));
        }
        assert!(cache.gc_queue_len() <= cache.max_size());
    }
    drop(live);

    assert!(cache.gc_queue_len() <= cache.max_size());
    for key in 0..3 {
        assert!(cache.contains(&key), "pinned entry {key} was evicted");
    }

    drop(pinned);
    assert!(cache.gc_queue_len() <= cache.max_size());
}

#[test]
fn test_shrinking_evicts_immediately() {
    setup();

    let manager = LockManager::default();
    let cache: Cache<u32, ()> = Cache::new(&manager, "shrinking", CacheConfig { max_size: 100 });

    for key in 0..50 {
        let mut requestor = manager.requestor();
        let _lock = cache.get_or_create_lock(&mut requestor, key);
    }
    assert_eq!(cache.len(), 50);

    cache.set_max_size(10);
    assert_eq!(cache.min_size(), 9);
    assert_eq!(cache.gc_queue_len(), 9);
    assert!(cache.contains(&49));
    assert!(cache.contains(&41));
    assert!(!cache.contains(&40));

    // already at the lower watermark
    cache.trim();
    assert_eq!(cache.gc_queue_len(), 9);
}

#[test]
fn test_hovering_at_max_size_does_not_churn() {
    setup();

    let manager = LockManager::default();
    let cache: Cache<u32, ()> = Cache::new(&manager, "hovering", CacheConfig { max_size: 10 });

    let mut lens = Vec::new();
    for key in 0..20 {
        let mut requestor = manager.requestor();
        let _lock = cache.get_or_create_lock(&mut requestor, key);
        drop(requestor);
        lens.push(cache.gc_queue_len());
    }

    // filling up to max_size evicts nothing
    assert_eq!(lens[9], 10);
    assert!(cache.contains(&0));
    // the first entry past max_size evicts down to min_size, then the queue refills
    assert_eq!(lens[10], 9);
    assert_eq!(lens[11], 10);
    assert_eq!(lens[12], 9);
    assert!(lens.iter().all(|&len| len <= cache.max_size()));
}

#[test]
fn test_explicit_trim() {
    setup();

    let manager = LockManager::default();
    let cache: Cache<u32, ()> = Cache::new(&manager, "trimmed", CacheConfig { max_size: 20 });

    for key in 0..20 {
        let mut requestor = manager.requestor();
        let _lock = cache.get_or_create_lock(&mut requestor, key);
    }
    assert_eq!(cache.gc_queue_len(), 20);

    cache.trim();
    assert_eq!(cache.gc_queue_len(), 18);
    assert!(!cache.contains(&1));
    assert!(cache.contains(&2));
}
