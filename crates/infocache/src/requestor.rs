use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::cache::{Cache, CacheId, Lock};
use crate::config::ExpirationKind;
use crate::entry::{EntryId, Timestamp};
use crate::manager::LockManager;
use crate::pool::LoadMutex;

/// Identifies a [`Requestor`] within its [`LockManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestorId(pub(crate) u64);

impl fmt::Display for RequestorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "requestor#{}", self.0)
    }
}

/// The usage references a requestor holds in one cache, with the key and value types erased.
pub(crate) trait UsageSet: Send {
    /// Drops all usage references in one batch.
    fn release(self: Box<Self>);

    fn len(&self) -> usize;

    /// Whether one of the usage references is for `entry`.
    fn contains_entry(&self, entry: EntryId) -> bool;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// The typed [`UsageSet`] of a single [`Cache`].
pub(crate) struct Usages<K, T> {
    cache: Cache<K, T>,
    pub locks: FxHashMap<K, Lock<K, T>>,
}

impl<K, T> UsageSet for Usages<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Default + Send + Sync + 'static,
{
    fn release(self: Box<Self>) {
        let Usages { cache, locks } = *self;
        cache.release_infos(locks.into_keys());
    }

    fn len(&self) -> usize {
        self.locks.len()
    }

    fn contains_entry(&self, entry: EntryId) -> bool {
        self.locks.values().any(|lock| lock.entry().id() == entry)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One logical unit of work.
///
/// A requestor collects every usage reference and load lock it acquires, across any number of
/// caches sharing its [`LockManager`], and gives all of them back when it is dropped (or when
/// [`release_all`](Self::release_all) is called). This holds on error paths as well: a load that
/// fails half-way leaves its entry unloaded rather than locked forever.
///
/// Requestors are not shared between threads. Nested loads performed on behalf of the same unit
/// of work should reuse the same requestor, so that waiting on each other is detected as a
/// deadlock.
pub struct Requestor {
    id: RequestorId,
    manager: LockManager,
    request_time: Timestamp,
    pub(crate) lock_map: FxHashMap<EntryId, Arc<LoadMutex>>,
    usage_map: FxHashMap<CacheId, Box<dyn UsageSet>>,
}

impl Requestor {
    pub(crate) fn new(id: RequestorId, manager: LockManager, request_time: Timestamp) -> Self {
        Self {
            id,
            manager,
            request_time,
            lock_map: FxHashMap::default(),
            usage_map: FxHashMap::default(),
        }
    }

    pub fn id(&self) -> RequestorId {
        self.id
    }

    pub fn manager(&self) -> &LockManager {
        &self.manager
    }

    /// The time this unit of work started.
    ///
    /// Entries are considered loaded for this requestor if they expire after this time.
    pub fn request_time(&self) -> Timestamp {
        self.request_time
    }

    /// The expiration to report for data loaded by this requestor.
    pub fn new_expiration(&self, kind: ExpirationKind) -> Timestamp {
        let ttl = self.manager.expiration().ttl(kind);
        self.request_time.saturating_add(ttl.as_secs())
    }

    /// The number of load locks currently held.
    pub fn load_lock_count(&self) -> usize {
        self.lock_map.len()
    }

    /// The number of usage references currently held, across all caches.
    pub fn usage_count(&self) -> usize {
        self.usage_map.values().map(|usages| usages.len()).sum()
    }

    /// Whether this requestor holds a usage reference for `entry` in `cache`.
    pub(crate) fn holds_usage(&self, cache: CacheId, entry: EntryId) -> bool {
        self.usage_map
            .get(&cache)
            .is_some_and(|usages| usages.contains_entry(entry))
    }

    /// Returns the usage references held in `cache`, creating an empty set on first use.
    pub(crate) fn usages<K, T>(&mut self, cache: &Cache<K, T>) -> &mut Usages<K, T>
    where
        K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
        T: Default + Send + Sync + 'static,
    {
        self.usage_map
            .entry(cache.id())
            .or_insert_with(|| {
                Box::new(Usages {
                    cache: cache.clone(),
                    locks: FxHashMap::default(),
                })
            })
            .as_any_mut()
            .downcast_mut()
            .expect("usage set type must match its cache")
    }

    /// Releases every load lock and usage reference held by this requestor.
    ///
    /// Load locks that were never reported as loaded leave their entry unloaded. Calling this
    /// more than once is a no-op.
    pub fn release_all(&mut self) {
        let manager = self.manager.clone();
        manager.release_all_load_locks(self);

        for (_, usages) in self.usage_map.drain() {
            usages.release();
        }
    }
}

impl Drop for Requestor {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl fmt::Debug for Requestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requestor")
            .field("id", &self.id)
            .field("request_time", &self.request_time)
            .field("load_locks", &self.lock_map.len())
            .field("usages", &self.usage_count())
            .finish()
    }
}
