use std::collections::VecDeque;

/// Fixed-capacity, insertion-ordered buffer.
///
/// When the buffer is full the oldest entry is evicted before the new one is
/// admitted, so the store always holds the most recent `capacity` insertions
/// in the order they arrived.
#[derive(Debug, Clone)]
pub struct BoundedOrderedStore<T> {
    entries: VecDeque<T>,
    capacity: usize,
    evicted: u64,
}

impl<T> BoundedOrderedStore<T> {
    /// Creates an empty store. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of entries evicted since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Appends `value`, returning the entry evicted to make room for it.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.entries.len() == self.capacity {
            self.evicted += 1;
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(value);
        evicted
    }

    pub fn back(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.entries.iter()
    }

    /// Looks up an entry by a key that increases with insertion order.
    pub fn find_by_key<K, F>(&self, key: &K, f: F) -> Option<&T>
    where
        K: Ord,
        F: FnMut(&T) -> K,
    {
        let index = self.entries.binary_search_by_key(key, f).ok()?;
        self.entries.get(index)
    }

    /// Mutable variant of [`find_by_key`](Self::find_by_key).
    pub fn find_by_key_mut<K, F>(&mut self, key: &K, f: F) -> Option<&mut T>
    where
        K: Ord,
        F: FnMut(&T) -> K,
    {
        let index = self.entries.binary_search_by_key(key, f).ok()?;
        self.entries.get_mut(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_recent_entries_in_insertion_order() {
        let capacity = 4;
        let extra = 3;
        let mut store = BoundedOrderedStore::new(capacity);
        for value in 1..=(capacity + extra) {
            store.push(value);
        }

        assert_eq!(store.len(), capacity);
        assert_eq!(store.evicted(), extra as u64);
        let kept: Vec<usize> = store.iter().copied().collect();
        assert_eq!(kept, vec![4, 5, 6, 7]);
    }

    #[test]
    fn push_reports_evicted_entry() {
        let mut store = BoundedOrderedStore::new(2);
        assert_eq!(store.push("a"), None);
        assert_eq!(store.push("b"), None);
        assert_eq!(store.push("c"), Some("a"));
        assert_eq!(store.back(), Some(&"c"));
    }

    #[test]
    fn zero_capacity_still_admits_latest_entry() {
        let mut store = BoundedOrderedStore::new(0);
        store.push(1);
        store.push(2);
        assert_eq!(store.capacity(), 1);
        assert_eq!(store.iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn find_by_key_skips_evicted_entries() {
        let mut store = BoundedOrderedStore::new(3);
        for id in 10u64..15 {
            store.push((id, "payload"));
        }
        assert!(store.find_by_key(&10, |entry| entry.0).is_none());
        assert_eq!(store.find_by_key(&13, |entry| entry.0), Some(&(13, "payload")));

        if let Some(entry) = store.find_by_key_mut(&14, |entry| entry.0) {
            entry.1 = "updated";
        }
        assert_eq!(store.back(), Some(&(14, "updated")));
    }
}
