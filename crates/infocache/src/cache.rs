use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashMap;

use crate::config::{CacheConfig, Config};
use crate::entry::{CacheEntry, Timestamp};
use crate::gc_queue::{GcPosition, GcQueue};
use crate::manager::{LockManager, LockState};
use crate::requestor::Requestor;

/// Identifies a [`Cache`] within its [`LockManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheId(pub(crate) u64);

/// The number of unused entries the lazy trimming pass leaves behind.
///
/// This is roughly 90% of `max_size`, so that a cache hovering around its limit does not evict
/// on every single release.
fn min_size(max_size: usize) -> usize {
    max_size - max_size / 10
}

struct Slot<K, T> {
    entry: Arc<CacheEntry<K, T>>,
    /// The number of requestors holding a usage reference.
    use_count: usize,
    /// Present exactly when `use_count == 0`.
    gc_position: Option<GcPosition>,
}

struct CacheInner<K, T> {
    entries: FxHashMap<K, Slot<K, T>>,
    gc_queue: GcQueue<K>,
    max_size: usize,
    min_size: usize,
}

impl<K, T> CacheInner<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn new(max_size: usize) -> Self {
        Self {
            entries: FxHashMap::default(),
            gc_queue: GcQueue::default(),
            max_size,
            min_size: min_size(max_size),
        }
    }

    /// Takes a usage reference to the slot, removing it from the GC queue on the first one.
    fn set_used(gc_queue: &mut GcQueue<K>, slot: &mut Slot<K, T>) {
        if slot.use_count == 0 {
            if let Some(position) = slot.gc_position.take() {
                gc_queue.remove(position);
            }
        }
        slot.use_count += 1;
    }

    /// Drops a usage reference, queueing the entry for GC when it was the last one.
    ///
    /// This does not run GC on its own; see [`set_unused`](Self::set_unused).
    fn mark_unused(&mut self, key: &K) {
        let Some(slot) = self.entries.get_mut(key) else {
            panic!("released unknown entry {key:?}");
        };
        assert!(slot.use_count > 0, "entry {key:?} is not in use");

        slot.use_count -= 1;
        if slot.use_count == 0 {
            slot.gc_position = Some(self.gc_queue.push_back(key.clone()));
        }
    }

    #[cfg(test)]
    fn set_unused(&mut self, key: &K, name: &str) {
        self.mark_unused(key);
        self.maybe_gc(name);
    }

    /// Once more than `max_size` entries are unused, evicts the oldest ones down to `min_size`.
    fn maybe_gc(&mut self, name: &str) {
        if self.gc_queue.len() > self.max_size {
            self.evict_down_to(self.min_size, name);
        }
    }

    /// Evicts the oldest unused entries until at most `min_size` remain unused.
    fn trim(&mut self, name: &str) {
        self.evict_down_to(self.min_size, name);
    }

    fn evict_down_to(&mut self, size: usize, name: &str) {
        let mut evicted: i64 = 0;
        while self.gc_queue.len() > size {
            let Some(key) = self.gc_queue.pop_front() else {
                break;
            };
            let slot = self.entries.remove(&key);
            assert!(
                slot.is_some_and(|slot| slot.use_count == 0),
                "evicted entry {key:?} is still in use"
            );
            tracing::trace!(cache = name, ?key, "Forgetting unused entry");
            evicted += 1;
        }

        if evicted > 0 {
            metric!(counter("infocache.gc.evicted") += evicted, "cache" => name);
            metric!(gauge("infocache.gc_queue") = self.gc_queue.len() as u64, "cache" => name);
        }
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let mut unused = 0;
        for (key, slot) in &self.entries {
            assert_eq!(
                slot.gc_position.is_some(),
                slot.use_count == 0,
                "GC position of {key:?} does not match its use count"
            );
            unused += usize::from(slot.use_count == 0);
        }
        assert_eq!(unused, self.gc_queue.len());
    }
}

struct CacheShared<K, T> {
    id: CacheId,
    name: String,
    manager: LockManager,
    inner: Mutex<CacheInner<K, T>>,
}

/// A keyed collection of entries of one type.
///
/// Entries are created on first use and stay around while any [`Requestor`] uses them. Once the
/// last usage reference is gone they enter a GC queue, from which the oldest ones are forgotten
/// whenever there are more than `max_size` of them.
///
/// This is a cheap handle; clones refer to the same cache.
pub struct Cache<K, T> {
    shared: Arc<CacheShared<K, T>>,
}

impl<K, T> Clone for Cache<K, T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, T> Cache<K, T> {
    pub fn id(&self) -> CacheId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn manager(&self) -> &LockManager {
        &self.shared.manager
    }
}

impl<K, T> Cache<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Default + Send + Sync + 'static,
{
    pub fn new(manager: &LockManager, name: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                id: manager.next_cache_id(),
                name: name.into(),
                manager: manager.clone(),
                inner: Mutex::new(CacheInner::new(config.max_size)),
            }),
        }
    }

    /// Creates a cache with the limits configured for `name`.
    pub fn from_config(manager: &LockManager, name: &str, config: &Config) -> Self {
        Self::new(manager, name, config.caches.for_cache(name))
    }

    /// Returns a usage reference to the entry for `key`, creating the entry if needed.
    ///
    /// The entry stays in the cache at least as long as `requestor` is alive. Asking for the
    /// same key again with the same requestor returns the same reference without counting it
    /// twice.
    pub fn get_or_create_lock(&self, requestor: &mut Requestor, key: K) -> Lock<K, T> {
        debug_assert!(self.manager().ptr_eq(requestor.manager()));
        if let Some(lock) = requestor.usages(self).locks.get(&key) {
            return lock.clone();
        }

        let entry = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            let slot = inner.entries.entry(key.clone()).or_insert_with(|| Slot {
                entry: Arc::new(CacheEntry::new(
                    self.shared.manager.next_entry_id(),
                    key.clone(),
                )),
                use_count: 0,
                gc_position: None,
            });
            CacheInner::set_used(&mut inner.gc_queue, slot);
            Arc::clone(&slot.entry)
        };

        let lock = Lock {
            cache: self.clone(),
            entry,
        };
        requestor.usages(self).locks.insert(key, lock.clone());
        lock
    }

    /// Returns the data for `key`, loading it with `fetch` unless it is loaded and fresh.
    ///
    /// Concurrent calls for the same key run `fetch` only once; the others wait and then read
    /// the published value. `fetch` gets the same `requestor` back so that loads it performs
    /// itself take part in deadlock detection. If waiting would deadlock, `fetch` runs without
    /// the load lock and its result is returned to this caller only.
    ///
    /// Errors from `fetch` are passed through, leaving the entry unloaded.
    pub fn get_or_load<E, F>(&self, requestor: &mut Requestor, key: K, fetch: F) -> Result<T, E>
    where
        T: Clone,
        F: FnOnce(&mut Requestor) -> Result<(T, Timestamp), E>,
    {
        metric!(counter("infocache.access") += 1, "cache" => self.name());
        let lock = self.get_or_create_lock(requestor, key);
        let manager = requestor.manager().clone();

        match manager.acquire_load_lock(requestor, &lock, false) {
            LockState::AlreadyLoaded => {
                metric!(counter("infocache.memory.hit") += 1, "cache" => self.name());
                Ok(lock.read().clone())
            }
            LockState::Locked(load) => match fetch(requestor) {
                Ok((value, expiration)) => {
                    load.set_payload(value.clone());
                    manager.report_loaded(requestor, load, expiration);
                    Ok(value)
                }
                Err(err) => {
                    manager.release_load_lock(requestor, load);
                    Err(err)
                }
            },
            LockState::ProceedUnlocked => fetch(requestor).map(|(value, _)| value),
        }
    }

    /// Gives back one usage reference for each of `keys`.
    pub(crate) fn release_infos(&self, keys: impl IntoIterator<Item = K>) {
        let name = self.name();
        let mut inner = self.shared.inner.lock();
        for key in keys {
            inner.mark_unused(&key);
        }
        inner.maybe_gc(name);
    }

    /// Changes the maximum number of unused entries, evicting right away if needed.
    pub fn set_max_size(&self, max_size: usize) {
        let mut inner = self.shared.inner.lock();
        inner.max_size = max_size;
        inner.min_size = min_size(max_size);
        inner.maybe_gc(self.name());
    }

    /// Evicts unused entries down to the lower watermark, even if `max_size` is not exceeded.
    pub fn trim(&self) {
        self.shared.inner.lock().trim(self.name());
    }

    pub fn max_size(&self) -> usize {
        self.shared.inner.lock().max_size
    }

    pub fn min_size(&self) -> usize {
        self.shared.inner.lock().min_size
    }

    /// The total number of entries, used or not.
    pub fn len(&self) -> usize {
        self.shared.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of unused entries waiting for eviction.
    pub fn gc_queue_len(&self) -> usize {
        self.shared.inner.lock().gc_queue.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.shared.inner.lock().entries.contains_key(key)
    }
}

impl<K, T> fmt::Debug for Cache<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (len, unused, max_size) = self
            .shared
            .inner
            .try_lock()
            .map(|inner| (inner.entries.len(), inner.gc_queue.len(), inner.max_size))
            .unwrap_or_default();
        f.debug_struct("Cache")
            .field("name", &self.shared.name)
            .field("entries", &len)
            .field("unused", &unused)
            .field("max_size", &max_size)
            .finish()
    }
}

/// A usage reference to a cache entry.
///
/// Holding a `Lock` does not grant the right to modify the entry; that takes a [`LoadLock`]
/// obtained from [`LockManager::acquire_load_lock`]. The reference is owned by the [`Requestor`]
/// it was created for and is only meaningful while that requestor is alive.
pub struct Lock<K, T> {
    cache: Cache<K, T>,
    entry: Arc<CacheEntry<K, T>>,
}

impl<K, T> Clone for Lock<K, T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<K, T> Lock<K, T> {
    pub(crate) fn entry(&self) -> &Arc<CacheEntry<K, T>> {
        &self.entry
    }

    pub fn key(&self) -> &K {
        self.entry.key()
    }

    pub(crate) fn cache_id(&self) -> CacheId {
        self.cache.id()
    }

    pub fn cache_name(&self) -> &str {
        self.cache.name()
    }

    /// Read access to the payload.
    ///
    /// The payload is only meaningful if [`is_loaded`](Self::is_loaded).
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.entry.read()
    }

    pub fn expiration(&self) -> Timestamp {
        self.entry.expiration()
    }

    /// Whether the entry holds data that is fresh for `requestor`.
    pub fn is_loaded(&self, requestor: &Requestor) -> bool {
        self.entry.is_loaded_and_fresh(requestor.request_time())
    }
}

impl<K: fmt::Debug, T> fmt::Debug for Lock<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("cache", &self.cache.name())
            .field("entry", &self.entry)
            .finish()
    }
}

/// The exclusive right to load a cache entry.
///
/// Hand it back with [`LockManager::report_loaded`] once the payload is in place.
#[must_use = "the entry stays locked until the load is reported"]
pub struct LoadLock<K, T> {
    lock: Lock<K, T>,
}

impl<K, T> LoadLock<K, T> {
    pub(crate) fn new(lock: Lock<K, T>) -> Self {
        Self { lock }
    }

    /// The usage reference this load lock belongs to.
    pub fn lock(&self) -> &Lock<K, T> {
        &self.lock
    }

    pub fn key(&self) -> &K {
        self.lock.key()
    }

    /// Replaces the payload.
    pub fn set_payload(&self, payload: T) {
        *self.lock.entry.write() = payload;
    }

    /// Write access to the payload.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.lock.entry.write()
    }
}

impl<K: fmt::Debug, T> fmt::Debug for LoadLock<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LoadLock").field(&self.lock).finish()
    }
}
