//! Thread-safe containers for the dynamic sets of encoders and profiles.
//!
//! Both containers keep an atomic size that is only updated while the write
//! lock is held, so `len()` always equals the number of committed inserts
//! minus committed deletes. Iteration works over a snapshot taken under the
//! read lock: callbacks may mutate the container without deadlocking, and a
//! concurrent mutation is either fully visible or not visible at all.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

/// Unordered key/value map with unique keys
pub struct ConcurrentMap<K, V> {
    data: RwLock<HashMap<K, V>>,
    size: AtomicUsize,
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            size: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.data.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.data.read().contains_key(key)
    }

    /// Returns the existing value if the key is present, otherwise stores `value`.
    /// The bool is true when an existing value was returned.
    pub fn get_or_insert(&self, key: K, value: V) -> (V, bool) {
        let mut data = self.data.write();
        if let Some(existing) = data.get(&key) {
            return (existing.clone(), true);
        }
        data.insert(key, value.clone());
        self.size.fetch_add(1, Ordering::SeqCst);
        (value, false)
    }

    /// Insert or replace, returning the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let mut data = self.data.write();
        let prev = data.insert(key, value);
        if prev.is_none() {
            self.size.fetch_add(1, Ordering::SeqCst);
        }
        prev
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut data = self.data.write();
        let prev = data.remove(key);
        if prev.is_some() {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        prev
    }

    pub fn clear(&self) {
        let mut data = self.data.write();
        data.clear();
        self.size.store(0, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every entry until `f` returns false.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for (k, v) in self.entries() {
            if !f(&k, &v) {
                break;
            }
        }
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.data.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.data.read().values().cloned().collect()
    }
}

impl<K, V> Default for ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered sequence with index removal and equality lookup
pub struct ConcurrentSlice<T> {
    data: RwLock<Vec<T>>,
    size: AtomicUsize,
}

impl<T> ConcurrentSlice<T>
where
    T: PartialEq + Clone,
{
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            size: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, item: T) {
        let mut data = self.data.write();
        data.push(item);
        self.size.fetch_add(1, Ordering::SeqCst);
    }

    /// Append unless an equal item is already present. Returns true if added.
    pub fn push_unique(&self, item: T) -> bool {
        let mut data = self.data.write();
        if data.iter().any(|t| *t == item) {
            return false;
        }
        data.push(item);
        self.size.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn remove(&self, index: usize) -> Option<T> {
        let mut data = self.data.write();
        if index >= data.len() {
            return None;
        }
        let item = data.remove(index);
        self.size.fetch_sub(1, Ordering::SeqCst);
        Some(item)
    }

    /// Remove the first item equal to `item`. Returns true if one was removed.
    pub fn remove_item(&self, item: &T) -> bool {
        let mut data = self.data.write();
        match data.iter().position(|t| t == item) {
            Some(index) => {
                data.remove(index);
                self.size.fetch_sub(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn index_of(&self, item: &T) -> Option<usize> {
        self.data.read().iter().position(|t| t == item)
    }

    pub fn clear(&self) {
        let mut data = self.data.write();
        data.clear();
        self.size.store(0, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot in insertion order.
    pub fn values(&self) -> Vec<T> {
        self.data.read().clone()
    }
}

impl<T> Default for ConcurrentSlice<T>
where
    T: PartialEq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_map_insert_replace_remove() {
        let map = ConcurrentMap::new();
        assert_eq!(map.insert("a", 1), None);
        assert_eq!(map.insert("a", 2), Some(1));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&"a"), Some(2));

        assert_eq!(map.get_or_insert("a", 3), (2, true));
        assert_eq!(map.get_or_insert("b", 4), (4, false));
        assert_eq!(map.len(), 2);

        assert_eq!(map.remove(&"a"), Some(2));
        assert_eq!(map.remove(&"a"), None);
        assert_eq!(map.len(), 1);

        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn test_map_size_after_concurrent_inserts_and_deletes() {
        const K: usize = 400;
        const M: usize = 150;
        let map = Arc::new(ConcurrentMap::new());
        for i in 0..M {
            map.insert(i, i);
        }

        let mut handles = Vec::new();
        for t in 0..4 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                for i in (t..K).step_by(4) {
                    map.insert(10_000 + i, i);
                }
            }));
        }
        for t in 0..3 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                for i in (t..M).step_by(3) {
                    map.remove(&i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(map.len(), K);
        assert_eq!(map.keys().len(), K);
    }

    #[test]
    fn test_map_mutation_during_iteration() {
        let map = ConcurrentMap::new();
        for i in 0..10 {
            map.insert(i, i * 2);
        }
        let mut seen = 0;
        map.for_each(|k, _| {
            map.remove(k);
            map.insert(k + 100, 0);
            seen += 1;
            true
        });
        assert_eq!(seen, 10);
        assert_eq!(map.len(), 10);
        assert!(map.keys().iter().all(|k| *k >= 100));
    }

    #[test]
    fn test_slice_order_and_identity() {
        let slice = ConcurrentSlice::new();
        assert!(slice.push_unique("x"));
        assert!(slice.push_unique("y"));
        assert!(!slice.push_unique("x"));
        slice.push("z");
        assert_eq!(slice.values(), vec!["x", "y", "z"]);
        assert_eq!(slice.index_of(&"y"), Some(1));

        assert_eq!(slice.remove(0), Some("x"));
        assert_eq!(slice.remove(5), None);
        assert!(slice.remove_item(&"z"));
        assert!(!slice.remove_item(&"z"));
        assert_eq!(slice.values(), vec!["y"]);
        assert_eq!(slice.len(), 1);
    }

    #[test]
    fn test_slice_concurrent_push_and_remove() {
        let slice = Arc::new(ConcurrentSlice::new());
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let slice = Arc::clone(&slice);
            handles.push(std::thread::spawn(move || {
                for i in 0..250u32 {
                    slice.push(t * 1000 + i);
                    if i % 2 == 0 {
                        assert!(slice.remove_item(&(t * 1000 + i)));
                    }
                    let _ = slice.values();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(slice.len(), 500);
        assert_eq!(slice.values().len(), 500);
    }
}
