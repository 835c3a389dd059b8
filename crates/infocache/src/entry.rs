use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Seconds since the UNIX epoch.
///
/// An expiration of `0` means "never loaded".
pub type Timestamp = u64;

/// The current wall clock time as a [`Timestamp`].
pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Identifies a cache entry across all caches of one [`LockManager`](crate::LockManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry#{}", self.0)
    }
}

/// The cached state for a single key.
///
/// Usage counting and the GC queue position live next to the entry in the owning
/// [`Cache`](crate::Cache), the load mutex in the [`LockManager`](crate::LockManager). What
/// remains here is what readers and loaders share directly.
pub(crate) struct CacheEntry<K, T> {
    id: EntryId,
    key: K,
    /// The highest expiration ever reported for this entry.
    expiration: AtomicU64,
    payload: RwLock<T>,
}

impl<K, T: Default> CacheEntry<K, T> {
    pub fn new(id: EntryId, key: K) -> Self {
        Self {
            id,
            key,
            expiration: AtomicU64::new(0),
            payload: RwLock::new(T::default()),
        }
    }
}

impl<K, T> CacheEntry<K, T> {
    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn expiration(&self) -> Timestamp {
        self.expiration.load(Ordering::Acquire)
    }

    /// Whether this entry holds data that is still valid for a request issued at `request_time`.
    pub fn is_loaded_and_fresh(&self, request_time: Timestamp) -> bool {
        self.expiration() > request_time
    }

    /// Raises the expiration to `new_expiration`, never lowering it.
    ///
    /// Returns the expiration in effect afterwards.
    pub fn update_expiration(&self, new_expiration: Timestamp) -> Timestamp {
        let previous = self.expiration.fetch_max(new_expiration, Ordering::AcqRel);
        previous.max(new_expiration)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.payload.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.payload.write()
    }
}

impl<K: fmt::Debug, T> fmt::Debug for CacheEntry<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("expiration", &self.expiration())
            .finish_non_exhaustive()
    }
}
