//! A coordinated single-flight load cache.
//!
//! This crate makes sure that a piece of externally fetched information is loaded at most once,
//! even if many threads ask for it at the same time, while keeping memory bounded.
//!
//! ## Moving parts
//!
//! - A [`LockManager`] hands out the exclusive right to load an entry. It is shared by every
//!   [`Cache`] whose loads may depend on each other, and detects when waiting for another loader
//!   would never finish.
//! - A [`Cache`] maps keys to entries of a single type. It counts how many requestors use each
//!   entry and forgets the oldest unused ones once there are too many.
//! - A [`Requestor`] is one unit of work. It remembers every usage reference ([`Lock`]) and load
//!   lock ([`LoadLock`]) it took, and gives them all back when dropped.
//!
//! ## Loading an entry
//!
//! ```
//! use infocache::{Cache, CacheConfig, ExpirationKind, LockManager, LockState};
//!
//! let manager = LockManager::default();
//! let cache: Cache<String, u32> = Cache::new(&manager, "lengths", CacheConfig::default());
//!
//! let mut requestor = manager.requestor();
//! let lock = cache.get_or_create_lock(&mut requestor, "hello".to_owned());
//! match manager.acquire_load_lock(&mut requestor, &lock, false) {
//!     LockState::AlreadyLoaded => {}
//!     LockState::Locked(load) => {
//!         load.set_payload(5);
//!         let expiration = requestor.new_expiration(ExpirationKind::Normal);
//!         manager.report_loaded(&mut requestor, load, expiration);
//!     }
//!     LockState::ProceedUnlocked => {
//!         // load without publishing
//!     }
//! }
//! assert_eq!(*lock.read(), 5);
//! ```
//!
//! [`Cache::get_or_load`] wraps all of the above into a single call.
//!
//! ## Deadlocks
//!
//! A requestor that holds the load lock for `K1` and needs `K2` while its loader needs `K1` in
//! turn would wait forever. Before blocking, the manager follows the chain of loaders and the
//! entries they are waiting for; if it leads back to the caller, the caller gets
//! [`LockState::ProceedUnlocked`] instead and loads the data on its own. Duplicated work is the
//! price for never hanging.
//!
//! ### Metrics
//!
//! When [`metrics::configure_statsd`] was called, the following metrics are emitted, tagged with
//! the `cache` name:
//!
//! - `infocache.access`: Number of [`Cache::get_or_load`] calls.
//! - `infocache.memory.hit`: The entry was already loaded.
//! - `infocache.gc.evicted`: Number of unused entries forgotten.
//! - `infocache.gc_queue`: Gauge of unused entries after an eviction.
//! - `lock.granted`, `lock.released`: Load locks handed out and given back.
//! - `lock.waited`: A requestor blocked on somebody else's load.
//! - `lock.deadlock_avoided`: A requestor proceeded unlocked instead of deadlocking.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod logging;

mod cache;
mod deadlock;
mod entry;
mod gc_queue;
mod manager;
mod pool;
mod requestor;

pub use cache::{Cache, CacheId, LoadLock, Lock};
pub use config::{CacheConfig, Config, ExpirationConfig, ExpirationKind};
pub use entry::{EntryId, Timestamp, now};
pub use manager::{LockManager, LockState};
pub use requestor::{Requestor, RequestorId};
