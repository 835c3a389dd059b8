use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cache::{CacheId, LoadLock, Lock};
use crate::config::{Config, ExpirationConfig};
use crate::deadlock::{WaitChain, walk_wait_chain};
use crate::entry::{self, EntryId, Timestamp};
use crate::pool::{LoadMutex, MutexPool};
use crate::requestor::{Requestor, RequestorId};

/// The outcome of [`LockManager::acquire_load_lock`].
#[must_use]
#[derive(Debug)]
pub enum LockState<K, T> {
    /// The entry holds fresh data, nothing needs to be loaded.
    AlreadyLoaded,
    /// The caller has the exclusive right to load the entry.
    ///
    /// Finish the load with [`LockManager::report_loaded`]. Dropping the lock without reporting
    /// keeps the entry locked until the requestor is released.
    Locked(LoadLock<K, T>),
    /// Somebody else is loading the entry, but waiting for them would never finish (or the caller
    /// asked not to wait).
    ///
    /// The caller should load the data on its own without publishing it into the entry.
    ProceedUnlocked,
}

/// State shared by all requestors, protected by the bookkeeping lock.
///
/// Critical sections on this only ever do map surgery; nobody blocks while holding it.
#[derive(Debug, Default)]
struct Bookkeeping {
    /// The mutex of every entry that is currently being loaded.
    loading: FxHashMap<EntryId, Arc<LoadMutex>>,
    /// The entry each blocked requestor is waiting for.
    waiting_for: FxHashMap<RequestorId, EntryId>,
    pool: MutexPool,
}

impl Bookkeeping {
    fn wait_chain(&self, requestor: RequestorId, entry: EntryId) -> WaitChain {
        walk_wait_chain(
            requestor,
            entry,
            |entry| {
                self.loading
                    .get(&entry)
                    .and_then(|mutex| mutex.loading_requestor())
            },
            |requestor| self.waiting_for.get(&requestor).copied(),
            self.waiting_for.len() + 1,
        )
    }

    /// Unlocks the load mutex of `entry` and hands it back to the pool.
    fn release(&mut self, entry: EntryId, held: Arc<LoadMutex>) {
        let Some(mutex) = self.loading.remove(&entry) else {
            panic!("{entry} is not being loaded");
        };
        assert!(
            Arc::ptr_eq(&mutex, &held),
            "load lock for {entry} belongs to another mutex"
        );
        drop(held);

        mutex.unlock();
        self.pool.release(mutex);
    }
}

struct ManagerInner {
    bookkeeping: Mutex<Bookkeeping>,
    next_id: AtomicU64,
    expiration: ExpirationConfig,
}

/// Coordinates who gets to load which entry.
///
/// A manager is shared (by cloning it) between all caches whose entries may be loaded from within
/// each other's loads, and between all [`Requestor`]s using those caches. Deadlock detection works
/// across all of them.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<ManagerInner>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(ExpirationConfig::default())
    }
}

impl LockManager {
    pub fn new(expiration: ExpirationConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                bookkeeping: Default::default(),
                next_id: AtomicU64::new(1),
                expiration,
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.expiration.clone())
    }

    pub fn expiration(&self) -> &ExpirationConfig {
        &self.inner.expiration
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_cache_id(&self) -> CacheId {
        CacheId(self.next_id())
    }

    pub(crate) fn next_entry_id(&self) -> EntryId {
        EntryId(self.next_id())
    }

    /// Starts a new unit of work at the current time.
    pub fn requestor(&self) -> Requestor {
        self.requestor_at(entry::now())
    }

    /// Starts a new unit of work with an explicit request time.
    pub fn requestor_at(&self, request_time: Timestamp) -> Requestor {
        let id = RequestorId(self.next_id());
        Requestor::new(id, self.clone(), request_time)
    }

    /// Whether `self` and `other` are handles to the same manager.
    pub fn ptr_eq(&self, other: &LockManager) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Obtains the right to load the entry behind `lock`.
    ///
    /// If another requestor is loading the entry right now, this blocks until that load is
    /// finished and then checks again. It does not block if `do_not_wait` is set, or if the other
    /// loader is (transitively) waiting for an entry `requestor` is loading itself; the result
    /// is [`LockState::ProceedUnlocked`] in both cases.
    pub fn acquire_load_lock<K, T>(
        &self,
        requestor: &mut Requestor,
        lock: &Lock<K, T>,
        do_not_wait: bool,
    ) -> LockState<K, T>
    where
        K: fmt::Debug,
    {
        debug_assert!(self.ptr_eq(requestor.manager()));
        let entry = lock.entry();
        let entry_id = entry.id();
        debug_assert!(
            requestor.holds_usage(lock.cache_id(), entry_id),
            "{} holds no usage reference for {entry_id}",
            requestor.id()
        );
        let cache = lock.cache_name();

        loop {
            let mut bookkeeping = self.inner.bookkeeping.lock();
            // clear the wait edge left over from the previous round
            bookkeeping.waiting_for.remove(&requestor.id());

            if entry.is_loaded_and_fresh(requestor.request_time()) {
                return LockState::AlreadyLoaded;
            }

            let mutex = match bookkeeping.loading.get(&entry_id) {
                Some(mutex) => Arc::clone(mutex),
                None => {
                    let mutex = bookkeeping.pool.acquire();
                    mutex.lock(requestor.id());
                    bookkeeping.loading.insert(entry_id, Arc::clone(&mutex));
                    drop(bookkeeping);

                    requestor.lock_map.insert(entry_id, mutex);
                    tracing::trace!(%entry_id, key = ?entry.key(), requestor = %requestor.id(), "Granted load lock");
                    metric!(counter("lock.granted") += 1, "cache" => cache);
                    return LockState::Locked(LoadLock::new(lock.clone()));
                }
            };

            if do_not_wait {
                return LockState::ProceedUnlocked;
            }

            let chain = bookkeeping.wait_chain(requestor.id(), entry_id);
            if chain.is_deadlock() {
                drop(bookkeeping);
                if chain == WaitChain::Overflow {
                    tracing::warn!(%entry_id, requestor = %requestor.id(), "Wait chain exceeded its bound, assuming deadlock");
                }
                tracing::debug!(%entry_id, key = ?entry.key(), requestor = %requestor.id(), "Avoided deadlock, loading without lock");
                metric!(counter("lock.deadlock_avoided") += 1, "cache" => cache);
                return LockState::ProceedUnlocked;
            }

            bookkeeping.waiting_for.insert(requestor.id(), entry_id);
            drop(bookkeeping);

            metric!(counter("lock.waited") += 1, "cache" => cache);
            mutex.wait_released();
        }
    }

    /// Publishes `new_expiration` for the loaded entry and releases the load lock.
    ///
    /// The entry's expiration only ever grows, so racing loads never make it less fresh.
    pub fn report_loaded<K, T>(
        &self,
        requestor: &mut Requestor,
        lock: LoadLock<K, T>,
        new_expiration: Timestamp,
    ) {
        let entry = lock.lock().entry();
        let entry_id = entry.id();
        let Some(held) = requestor.lock_map.remove(&entry_id) else {
            panic!("{} does not hold the load lock for {entry_id}", requestor.id());
        };

        let mut bookkeeping = self.inner.bookkeeping.lock();
        let expiration = entry.update_expiration(new_expiration);
        bookkeeping.release(entry_id, held);
        drop(bookkeeping);

        tracing::trace!(%entry_id, expiration, "Reported entry as loaded");
        metric!(counter("lock.released") += 1, "cache" => lock.lock().cache_name());
    }

    /// Releases the load lock without publishing anything, leaving the entry unloaded.
    ///
    /// This is how a failed load gets out of the way of other requestors before the whole unit of
    /// work finishes.
    pub fn release_load_lock<K, T>(&self, requestor: &mut Requestor, lock: LoadLock<K, T>) {
        let entry_id = lock.lock().entry().id();
        let Some(held) = requestor.lock_map.remove(&entry_id) else {
            panic!("{} does not hold the load lock for {entry_id}", requestor.id());
        };

        self.inner.bookkeeping.lock().release(entry_id, held);
        tracing::trace!(%entry_id, "Abandoned load lock");
        metric!(counter("lock.released") += 1, "cache" => lock.lock().cache_name());
    }

    /// Releases every load lock `requestor` still holds.
    pub fn release_all_load_locks(&self, requestor: &mut Requestor) {
        if requestor.lock_map.is_empty() {
            return;
        }

        let count = requestor.lock_map.len();
        let mut bookkeeping = self.inner.bookkeeping.lock();
        for (entry_id, held) in requestor.lock_map.drain() {
            bookkeeping.release(entry_id, held);
        }
        drop(bookkeeping);

        tracing::debug!(requestor = %requestor.id(), count, "Released unfinished load locks");
    }

    /// The number of requestors currently blocked on another requestor's load.
    pub fn waiting_requestors(&self) -> usize {
        self.inner.bookkeeping.lock().waiting_for.len()
    }

    /// The number of entries currently being loaded.
    pub fn loading_entries(&self) -> usize {
        self.inner.bookkeeping.lock().loading.len()
    }

    /// The number of load mutexes allocated so far, and how many of them sit in the pool.
    pub fn mutex_stats(&self) -> (usize, usize) {
        let bookkeeping = self.inner.bookkeeping.lock();
        (bookkeeping.pool.created(), bookkeeping.pool.free_len())
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (loading, waiting) = self
            .inner
            .bookkeeping
            .try_lock()
            .map(|b| (b.loading.len(), b.waiting_for.len()))
            .unwrap_or_default();
        f.debug_struct("LockManager")
            .field("loading", &loading)
            .field("waiting", &waiting)
            .field("expiration", &self.inner.expiration)
            .finish()
    }
}
