//! Implements a byte-budgeted LRU eviction policy.

use std::hash::Hash;
use std::sync::Mutex;

use hashlink::LinkedHashMap;

#[derive(Debug)]
struct LruState<K> {
    /// The ordered set of keys, front is least recently used. Values are the accounted sizes.
    ordered_key_map: LinkedHashMap<K, u64>,
    /// Sum of all accounted sizes.
    total: u64,
}

/// Tracks the least recently used keys of a cache against a total byte budget.
///
/// The tracker does not own the cached values. [`touch`](Self::touch) reports which keys the
/// owner must drop to get back under budget; the owner is responsible for actually deleting them
/// and for calling [`remove`](Self::remove) when it drops a key for other reasons.
#[derive(Debug)]
pub struct LruEvictionTracker<K> {
    max_bytes: u64,
    state: Mutex<LruState<K>>,
}

impl<K: Eq + Hash + Clone> LruEvictionTracker<K> {
    /// Create a tracker that keeps the accounted total at or below `max_bytes`.
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            state: Mutex::new(LruState {
                ordered_key_map: LinkedHashMap::new(),
                total: 0,
            }),
        }
    }

    /// Record an access to `key` whose value is `size` bytes, moving it to the most recently used
    /// position.
    ///
    /// Returns the keys that must be evicted to respect the budget, least recently used first.
    /// `key` itself is never part of the returned set, even if it alone exceeds the budget.
    pub fn touch(&self, key: &K, size: u64) -> Vec<K> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(prev) = state.ordered_key_map.remove(key) {
            state.total -= prev;
        }
        state.ordered_key_map.insert(key.clone(), size);
        state.total += size;

        let mut evicted = Vec::new();
        while state.total > self.max_bytes {
            let Some((front, front_size)) = state.ordered_key_map.pop_front() else {
                break;
            };
            if &front == key {
                // Only the key we just touched is left.
                state.ordered_key_map.insert(front, front_size);
                break;
            }
            state.total -= front_size;
            evicted.push(front);
        }
        evicted
    }

    /// Stop tracking `key`.
    pub fn remove(&self, key: &K) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(size) = state.ordered_key_map.remove(key) {
            state.total -= size;
        }
    }

    /// Stop tracking every key for which `keep` returns `false`.
    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let dropped: Vec<K> = state
            .ordered_key_map
            .keys()
            .filter(|k| !keep(k))
            .cloned()
            .collect();
        for k in &dropped {
            if let Some(size) = state.ordered_key_map.remove(k) {
                state.total -= size;
            }
        }
    }

    /// Total accounted bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .total
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .ordered_key_map
            .len()
    }

    /// Returns `true` if no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::LruEvictionTracker;

    #[test]
    fn evicts_least_recently_touched_first() {
        let lru = LruEvictionTracker::new(10);
        assert!(lru.touch(&"a", 4).is_empty());
        assert!(lru.touch(&"b", 4).is_empty());
        assert_eq!(lru.touch(&"c", 4), vec!["a"]);
        assert_eq!(lru.total_bytes(), 8);
    }

    #[test]
    fn touching_moves_key_to_back() {
        let lru = LruEvictionTracker::new(10);
        lru.touch(&"a", 4);
        lru.touch(&"b", 4);
        lru.touch(&"a", 4);
        assert_eq!(lru.touch(&"c", 4), vec!["b"]);
    }

    #[test]
    fn oversized_key_is_kept_alone() {
        let lru = LruEvictionTracker::new(10);
        lru.touch(&"a", 4);
        assert_eq!(lru.touch(&"big", 64), vec!["a"]);
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.total_bytes(), 64);
    }

    #[test]
    fn resize_on_touch_updates_total() {
        let lru = LruEvictionTracker::new(100);
        lru.touch(&"a", 40);
        lru.touch(&"a", 10);
        assert_eq!(lru.total_bytes(), 10);
        lru.remove(&"a");
        assert!(lru.is_empty());
        assert_eq!(lru.total_bytes(), 0);
    }

    #[test]
    fn retain_drops_unlisted_keys() {
        let lru = LruEvictionTracker::new(100);
        lru.touch(&"a", 1);
        lru.touch(&"b", 2);
        lru.touch(&"c", 3);
        lru.retain(|k| *k != "b");
        assert_eq!(lru.len(), 2);
        assert_eq!(lru.total_bytes(), 4);
    }
}
