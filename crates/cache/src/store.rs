use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// A plain LRU map: lookups refresh recency, inserts evict the least
/// recently used entries once the capacity is reached.
pub(crate) struct LruStore<K, V> {
    capacity: usize,
    entries: HashMap<K, Entry<V>>,
    order: BTreeMap<u64, K>,
    clock: u64,
}

struct Entry<V> {
    value: V,
    sequence: u64,
}

impl<K, V> LruStore<K, V>
where
    K: Hash + Eq + Clone,
{
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
        }
    }

    /// Looks up `key`, marking it most recently used.
    pub(crate) fn get(&mut self, key: &K) -> Option<&V> {
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.sequence);
        self.clock += 1;
        entry.sequence = self.clock;
        self.order.insert(self.clock, key.clone());
        Some(&entry.value)
    }

    pub(crate) fn insert(&mut self, key: K, value: V) {
        self.remove(&key);
        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.clock += 1;
        self.order.insert(self.clock, key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                sequence: self.clock,
            },
        );
    }

    pub(crate) fn remove(&mut self, key: &K) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.sequence);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut store = LruStore::new(2);
        store.insert("a", 1);
        store.insert("b", 2);
        assert_eq!(store.get(&"a"), Some(&1));
        store.insert("c", 3);

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&"b"), None);
        assert_eq!(store.get(&"a"), Some(&1));
        assert_eq!(store.get(&"c"), Some(&3));
    }

    #[test]
    fn reinsert_replaces_in_place() {
        let mut store = LruStore::new(2);
        store.insert("a", 1);
        store.insert("a", 2);
        store.insert("b", 3);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&"a"), Some(&2));
    }
}
