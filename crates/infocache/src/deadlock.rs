//! Cycle detection on the wait-for graph.
//!
//! The graph alternates between two kinds of edges:
//!
//! ```text
//! entry ──loaded by──▶ requestor ──waiting for──▶ entry ──loaded by──▶ requestor ...
//! ```
//!
//! Every requestor waits on at most one entry and every entry has at most one loader, so the
//! graph reachable from a single entry is a simple chain. If that chain leads back to the
//! requestor that is about to block, blocking would never finish.

use crate::entry::EntryId;
use crate::requestor::RequestorId;

/// The outcome of walking the wait-for chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitChain {
    /// The chain ends at an entry without a loader, or at a loader that is not blocked.
    DeadEnd,
    /// The chain leads back to the starting requestor.
    Cycle,
    /// The chain was longer than the number of possible distinct hops.
    ///
    /// This can only happen if there is a cycle that does not include the starting requestor.
    Overflow,
}

impl WaitChain {
    /// Whether the starting requestor must not block.
    pub fn is_deadlock(self) -> bool {
        !matches!(self, Self::DeadEnd)
    }
}

/// Follows the chain of loaders and the entries they wait for, starting at `entry`.
///
/// `max_hops` bounds the walk; it should be at least the number of waiting requestors.
pub(crate) fn walk_wait_chain<L, W>(
    requestor: RequestorId,
    entry: EntryId,
    loader_of: L,
    waiting_for: W,
    max_hops: usize,
) -> WaitChain
where
    L: Fn(EntryId) -> Option<RequestorId>,
    W: Fn(RequestorId) -> Option<EntryId>,
{
    let mut entry = entry;
    for _ in 0..=max_hops {
        let Some(loader) = loader_of(entry) else {
            return WaitChain::DeadEnd;
        };
        if loader == requestor {
            return WaitChain::Cycle;
        }
        let Some(next) = waiting_for(loader) else {
            return WaitChain::DeadEnd;
        };
        entry = next;
    }
    WaitChain::Overflow
}
