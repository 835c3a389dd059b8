use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use infocache::{Cache, CacheConfig, LockManager, LockState};
use infocache_test::{run_with_timeout, setup};

const THREADS: usize = 16;

#[derive(Default)]
struct Outcomes {
    locked: AtomicUsize,
    already_loaded: AtomicUsize,
    unlocked: AtomicUsize,
}

#[test]
fn test_single_loader_under_contention() {
    setup();

    let manager = LockManager::default();
    let cache: Cache<String, u32> = Cache::new(&manager, "contention", CacheConfig::default());
    let outcomes = Arc::new(Outcomes::default());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let manager = manager.clone();
            let cache = cache.clone();
            let outcomes = Arc::clone(&outcomes);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut requestor = manager.requestor_at(0);
                let lock = cache.get_or_create_lock(&mut requestor, "K1".to_owned());
                barrier.wait();

                match manager.acquire_load_lock(&mut requestor, &lock, false) {
                    LockState::Locked(load) => {
                        outcomes.locked.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        load.set_payload(1);
                        manager.report_loaded(&mut requestor, load, 1000);
                    }
                    LockState::AlreadyLoaded => {
                        outcomes.already_loaded.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(*lock.read(), 1);
                    }
                    LockState::ProceedUnlocked => {
                        outcomes.unlocked.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    run_with_timeout(Duration::from_secs(10), move || {
        for handle in handles {
            handle.join().unwrap();
        }
    });

    assert_eq!(outcomes.locked.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.already_loaded.load(Ordering::SeqCst), THREADS - 1);
    assert_eq!(outcomes.unlocked.load(Ordering::SeqCst), 0);
    assert_eq!(manager.loading_entries(), 0);
    assert_eq!(manager.waiting_requestors(), 0);
}

#[test]
fn test_get_or_load_fetches_once() {
    setup();

    let manager = LockManager::default();
    let cache: Cache<String, String> = Cache::new(&manager, "fetch_once", CacheConfig::default());
    let fetches = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let manager = manager.clone();
            let cache = cache.clone();
            let fetches = Arc::clone(&fetches);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut requestor = manager.requestor_at(0);
                barrier.wait();
                cache.get_or_load(&mut requestor, "K1".to_owned(), |_| {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    Ok::<_, ()>(("payload".to_owned(), 1000))
                })
            })
        })
        .collect();

    let results = run_with_timeout(Duration::from_secs(10), move || {
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.as_deref(), Ok("payload"));
    }
}

#[test]
fn test_unrelated_entries_load_concurrently() {
    setup();

    let manager = LockManager::default();
    let cache: Cache<String, u32> = Cache::new(&manager, "unrelated", CacheConfig::default());

    let mut slow = manager.requestor_at(0);
    let k1 = cache.get_or_create_lock(&mut slow, "K1".to_owned());
    let LockState::Locked(load_k1) = manager.acquire_load_lock(&mut slow, &k1, false) else {
        panic!("expected to get the load lock");
    };

    // loading K2 must not wait for the outstanding load of K1
    let value = {
        let manager = manager.clone();
        let cache = cache.clone();
        run_with_timeout(Duration::from_secs(5), move || {
            let mut requestor = manager.requestor_at(0);
            cache.get_or_load(&mut requestor, "K2".to_owned(), |_| Ok::<_, ()>((2, 1000)))
        })
    };
    assert_eq!(value, Ok(2));

    manager.report_loaded(&mut slow, load_k1, 1000);
    assert_eq!(manager.loading_entries(), 0);
}
