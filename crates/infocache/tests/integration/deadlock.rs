use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use infocache::{Cache, CacheConfig, ExpirationKind, LockManager, Requestor};
use infocache_test::{run_with_timeout, setup};

type Names = Cache<&'static str, String>;

/// Loads `key`, and from within that load, `dependency`.
///
/// All top-level loads meet at `barrier` while holding their load lock, so the nested loads are
/// guaranteed to find each other's entries locked.
fn load_with_dependency(
    cache: &Names,
    requestor: &mut Requestor,
    key: &'static str,
    dependency: &'static str,
    barrier: &Barrier,
    fetches: &AtomicUsize,
) -> String {
    cache
        .get_or_load(requestor, key, |requestor| {
            fetches.fetch_add(1, Ordering::SeqCst);
            barrier.wait();

            let inner = cache.get_or_load(requestor, dependency, |requestor| {
                fetches.fetch_add(1, Ordering::SeqCst);
                let expiration = requestor.new_expiration(ExpirationKind::Normal);
                Ok::<_, ()>((format!("{dependency} (nested)"), expiration))
            })?;

            let expiration = requestor.new_expiration(ExpirationKind::Normal);
            Ok::<_, ()>((format!("{key} -> {inner}"), expiration))
        })
        .unwrap()
}

fn run_cycle(keys: &'static [&'static str]) -> (Vec<String>, usize) {
    let manager = LockManager::default();
    let cache: Names = Cache::new(&manager, "names", CacheConfig::default());
    let barrier = Arc::new(Barrier::new(keys.len()));
    let fetches = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..keys.len())
        .map(|i| {
            let key = keys[i];
            let dependency = keys[(i + 1) % keys.len()];
            let manager = manager.clone();
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            let fetches = Arc::clone(&fetches);
            thread::spawn(move || {
                let mut requestor = manager.requestor();
                load_with_dependency(
                    &cache,
                    &mut requestor,
                    key,
                    dependency,
                    &barrier,
                    &fetches,
                )
            })
        })
        .collect();

    let results: Vec<String> = run_with_timeout(Duration::from_secs(5), move || {
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    assert_eq!(manager.loading_entries(), 0);
    assert_eq!(manager.waiting_requestors(), 0);
    (results, fetches.load(Ordering::SeqCst))
}

#[test]
fn test_two_requestors_needing_each_other() {
    setup();

    for _ in 0..20 {
        let (results, fetches) = run_cycle(&["K1", "K2"]);

        // both top-level loads, plus exactly one nested load that proceeded unlocked
        assert_eq!(fetches, 3);
        assert!(results[0].starts_with("K1 -> K2"));
        assert!(results[1].starts_with("K2 -> K1"));
    }
}

#[test]
fn test_three_party_cycle() {
    setup();

    for _ in 0..10 {
        let (results, fetches) = run_cycle(&["K1", "K2", "K3"]);

        assert_eq!(fetches, 4);
        assert_eq!(results.len(), 3);
    }
}

#[test]
fn test_nested_load_of_own_entry() {
    setup();

    let manager = LockManager::default();
    let cache: Names = Cache::new(&manager, "names", CacheConfig::default());

    let value = run_with_timeout(Duration::from_secs(5), move || {
        let mut requestor = manager.requestor();
        cache
            .get_or_load(&mut requestor, "K1", |requestor| {
                // asking for the entry we are loading ourselves must not block
                let inner =
                    cache.get_or_load(requestor, "K1", |_| Ok::<_, ()>(("inner".to_owned(), 0)))?;
                let expiration = requestor.new_expiration(ExpirationKind::Short);
                Ok::<_, ()>((format!("outer({inner})"), expiration))
            })
            .unwrap()
    });

    assert_eq!(value, "outer(inner)");
}
