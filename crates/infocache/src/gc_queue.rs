use std::collections::BTreeMap;

/// A handle to an element of a [`GcQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GcPosition(u64);

/// The keys of all unused entries, in the order in which they became unused.
///
/// Elements are addressed by the [`GcPosition`] returned from [`push_back`](Self::push_back), so
/// an entry that is used again can be taken out of the middle of the queue without a scan.
#[derive(Debug)]
pub(crate) struct GcQueue<K> {
    queue: BTreeMap<u64, K>,
    next_position: u64,
}

impl<K> Default for GcQueue<K> {
    fn default() -> Self {
        Self {
            queue: BTreeMap::new(),
            next_position: 0,
        }
    }
}

impl<K> GcQueue<K> {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Appends `key` as the most recently unused element.
    pub fn push_back(&mut self, key: K) -> GcPosition {
        let position = self.next_position;
        self.next_position += 1;
        self.queue.insert(position, key);
        GcPosition(position)
    }

    /// Takes the element at `position` out of the queue.
    pub fn remove(&mut self, position: GcPosition) -> Option<K> {
        self.queue.remove(&position.0)
    }

    /// Takes out the element that has been unused the longest.
    pub fn pop_front(&mut self) -> Option<K> {
        self.queue.pop_first().map(|(_, key)| key)
    }
}
