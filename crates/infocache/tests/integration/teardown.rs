use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use infocache::{Cache, CacheConfig, LockManager, LockState};
use infocache_test::{run_with_timeout, setup};

#[test]
fn test_release_all_twice() {
    setup();

    let manager = LockManager::default();
    let cache: Cache<u32, u32> = Cache::new(&manager, "numbers", CacheConfig::default());

    let mut requestor = manager.requestor();
    let lock = cache.get_or_create_lock(&mut requestor, 1);
    let _load = match manager.acquire_load_lock(&mut requestor, &lock, false) {
        LockState::Locked(load) => load,
        other => panic!("expected the load lock, got {other:?}"),
    };
    assert_eq!(requestor.usage_count(), 1);
    assert_eq!(requestor.load_lock_count(), 1);

    requestor.release_all();
    assert_eq!(requestor.usage_count(), 0);
    assert_eq!(requestor.load_lock_count(), 0);
    assert_eq!(manager.loading_entries(), 0);
    assert_eq!(cache.gc_queue_len(), 1);

    requestor.release_all();
    assert_eq!(manager.loading_entries(), 0);
    assert_eq!(cache.gc_queue_len(), 1);
}

#[test]
fn test_abandoned_load_lock_is_released_on_drop() {
    setup();

    let manager = LockManager::default();
    let cache: Cache<u32, u32> = Cache::new(&manager, "numbers", CacheConfig::default());

    {
        let mut requestor = manager.requestor_at(0);
        let lock = cache.get_or_create_lock(&mut requestor, 1);
        let LockState::Locked(load) = manager.acquire_load_lock(&mut requestor, &lock, false)
        else {
            panic!("expected the load lock");
        };
        load.set_payload(7);
        drop(load);
        assert_eq!(manager.loading_entries(), 1);
    }
    assert_eq!(manager.loading_entries(), 0);

    // the payload was written, but never reported as loaded
    let mut requestor = manager.requestor_at(0);
    let lock = cache.get_or_create_lock(&mut requestor, 1);
    assert!(!lock.is_loaded(&requestor));
    assert!(matches!(
        manager.acquire_load_lock(&mut requestor, &lock, false),
        LockState::Locked(_)
    ));
}

#[test]
fn test_panicking_loader_releases_its_lock() {
    setup();

    let manager = LockManager::default();
    let cache: Cache<u32, u32> = Cache::new(&manager, "numbers", CacheConfig::default());

    let handle = {
        let manager = manager.clone();
        let cache = cache.clone();
        thread::spawn(move || {
            let mut requestor = manager.requestor();
            cache.get_or_load(&mut requestor, 1, |_| -> Result<(u32, u64), ()> {
                panic!("fetch failed hard")
            })
        })
    };
    assert!(handle.join().is_err());
    assert_eq!(manager.loading_entries(), 0);

    let mut requestor = manager.requestor_at(0);
    let value = cache.get_or_load(&mut requestor, 1, |_| Ok::<_, ()>((42, 1000)));
    assert_eq!(value, Ok(42));
}

#[test]
fn test_waiter_takes_over_failed_load() {
    setup();

    let manager = LockManager::default();
    let cache: Cache<u32, u32> = Cache::new(&manager, "numbers", CacheConfig::default());
    let fetches = Arc::new(AtomicUsize::new(0));
    let (started_tx, started_rx) = mpsc::channel();
    let (fail_tx, fail_rx) = mpsc::channel::<()>();

    let failing = {
        let manager = manager.clone();
        let cache = cache.clone();
        let fetches = Arc::clone(&fetches);
        thread::spawn(move || {
            let mut requestor = manager.requestor_at(0);
            cache.get_or_load(&mut requestor, 1, |_| {
                fetches.fetch_add(1, Ordering::SeqCst);
                started_tx.send(()).unwrap();
                fail_rx.recv().unwrap();
                Err("upstream unavailable")
            })
        })
    };
    started_rx.recv().unwrap();

    let waiting = {
        let manager = manager.clone();
        let cache = cache.clone();
        let fetches = Arc::clone(&fetches);
        thread::spawn(move || {
            let mut requestor = manager.requestor_at(0);
            cache.get_or_load(&mut requestor, 1, |_| {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>((5, 1000))
            })
        })
    };

    while manager.waiting_requestors() == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    fail_tx.send(()).unwrap();

    let (failed, loaded) = run_with_timeout(Duration::from_secs(5), move || {
        (failing.join().unwrap(), waiting.join().unwrap())
    });

    assert_eq!(failed, Err("upstream unavailable"));
    assert_eq!(loaded, Ok(5));
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(manager.loading_entries(), 0);
}
