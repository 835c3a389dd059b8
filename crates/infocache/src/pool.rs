//! Recycling of the per-entry [`LoadMutex`]es.
//!
//! Entries come and go at a high rate, while only a handful of them are being loaded at any
//! point in time. Instead of allocating a fresh mutex for every load, finished mutexes are put
//! back into a free list and handed out again for the next load.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::requestor::RequestorId;

/// The exclusive "I am loading this entry" lock.
///
/// The lock itself is not tied to a guard: it is held from the moment a loader is recorded until
/// [`unlock`](Self::unlock) is called, possibly from a different stack frame. Other requestors
/// block in [`wait_released`](Self::wait_released) until that happens.
#[derive(Debug, Default)]
pub(crate) struct LoadMutex {
    loading_requestor: Mutex<Option<RequestorId>>,
    released: Condvar,
}

impl LoadMutex {
    /// The requestor currently holding this mutex, if any.
    pub fn loading_requestor(&self) -> Option<RequestorId> {
        *self.loading_requestor.lock()
    }

    pub fn is_held(&self) -> bool {
        self.loading_requestor().is_some()
    }

    /// Records `requestor` as the exclusive holder of this mutex.
    pub fn lock(&self, requestor: RequestorId) {
        let mut loading_requestor = self.loading_requestor.lock();
        assert!(
            loading_requestor.is_none(),
            "load mutex is already held by {loading_requestor:?}"
        );
        *loading_requestor = Some(requestor);
    }

    /// Clears the holder and wakes up everybody blocked in [`wait_released`](Self::wait_released).
    pub fn unlock(&self) -> Option<RequestorId> {
        let previous = self.loading_requestor.lock().take();
        self.released.notify_all();
        previous
    }

    /// Blocks the current thread until the mutex is unlocked.
    ///
    /// Returns immediately if the mutex is not held. A mutex cannot be handed out to another
    /// entry while a waiter keeps a reference to it, so waking up always means the load this
    /// waiter cared about has finished (or was abandoned).
    pub fn wait_released(&self) {
        let mut loading_requestor = self.loading_requestor.lock();
        while loading_requestor.is_some() {
            self.released.wait(&mut loading_requestor);
        }
    }
}

/// A free list of [`LoadMutex`]es.
#[derive(Debug, Default)]
pub(crate) struct MutexPool {
    free: Vec<Arc<LoadMutex>>,
    created: usize,
}

impl MutexPool {
    /// Hands out an unused mutex, reusing a previously released one if possible.
    pub fn acquire(&mut self) -> Arc<LoadMutex> {
        match self.free.pop() {
            Some(mutex) => {
                assert!(!mutex.is_held(), "pooled load mutex is still held");
                assert_eq!(
                    Arc::strong_count(&mutex),
                    1,
                    "pooled load mutex is still referenced"
                );
                mutex
            }
            None => {
                self.created += 1;
                Arc::default()
            }
        }
    }

    /// Puts `mutex` back into the free list, unless somebody else still refers to it.
    ///
    /// Waiters that still hold a reference will drop it once they wake up, at which point the
    /// mutex is simply deallocated.
    pub fn release(&mut self, mutex: Arc<LoadMutex>) {
        debug_assert!(!mutex.is_held());
        if Arc::strong_count(&mutex) == 1 {
            self.free.push(mutex);
        }
    }

    /// The number of mutexes ready to be reused.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// The total number of mutexes this pool ever allocated.
    pub fn created(&self) -> usize {
        self.created
    }
}
