//! Size-limited associative container with least-recently-used eviction.
//!
//! Eviction only considers entries the caller's removability test admits;
//! if nothing is removable the map temporarily exceeds its limit rather
//! than dropping an entry that is still in use.

use std::collections::HashMap;
use std::hash::Hash;

fn default_removable<V>(_: &V) -> bool {
    true
}

struct Entry<K, V> {
    value: V,
    newer: Option<K>,
    older: Option<K>,
}

pub struct LruCacheMap<K, V> {
    max_size: usize,
    is_removable: fn(&V) -> bool,
    entries: HashMap<K, Entry<K, V>>,
    newest: Option<K>,
    oldest: Option<K>,
}

impl<K, V> LruCacheMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(max_size: usize) -> Self {
        Self::with_removability(max_size, default_removable)
    }

    pub fn with_removability(max_size: usize, is_removable: fn(&V) -> bool) -> Self {
        Self {
            max_size,
            is_removable,
            entries: HashMap::new(),
            newest: None,
            oldest: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the value at `key`, inserting a default if absent, and
    /// makes the entry the most recently used. An insertion that pushes
    /// the map past its limit evicts the oldest removable entry, if any.
    pub fn get_or_default(&mut self, key: &K) -> &mut V
    where
        V: Default,
    {
        if self.entries.contains_key(key) {
            self.unlink(key);
        } else {
            self.entries.insert(
                key.clone(),
                Entry {
                    value: V::default(),
                    newer: None,
                    older: None,
                },
            );

            // The new entry is not on the recency chain yet, so the walk
            // below cannot pick it as the victim.
            if self.entries.len() > self.max_size {
                if let Some(victim) = self.find_removable() {
                    self.erase(&victim);
                }
            }
        }

        self.make_newest(key);

        &mut self.entries.get_mut(key).expect("entry just linked").value
    }

    /// Returns a copy of the value at `key` without touching recency.
    pub fn find(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn erase(&mut self, key: &K) {
        if !self.entries.contains_key(key) {
            return;
        }

        self.unlink(key);
        self.entries.remove(key);
    }

    pub fn for_each_newest(&self, mut callback: impl FnMut(&K, &V)) {
        let mut cursor = self.newest.clone();

        while let Some(key) = cursor {
            let entry = &self.entries[&key];
            callback(&key, &entry.value);
            cursor = entry.older.clone();
        }
    }

    pub fn for_each_oldest(&self, mut callback: impl FnMut(&K, &V)) {
        let mut cursor = self.oldest.clone();

        while let Some(key) = cursor {
            let entry = &self.entries[&key];
            callback(&key, &entry.value);
            cursor = entry.newer.clone();
        }
    }

    // Walks from the oldest end looking for an entry the removability
    // test admits.
    fn find_removable(&self) -> Option<K> {
        let mut cursor = self.oldest.clone();

        while let Some(key) = cursor {
            let entry = &self.entries[&key];

            if (self.is_removable)(&entry.value) {
                return Some(key);
            }

            cursor = entry.newer.clone();
        }

        None
    }

    fn unlink(&mut self, key: &K) {
        let (older, newer) = {
            let entry = self.entries.get_mut(key).expect("unlink of absent key");
            (entry.older.take(), entry.newer.take())
        };

        match &older {
            Some(older_key) => {
                self.entries.get_mut(older_key).expect("chain link").newer = newer.clone();
            }
            None => {
                if self.oldest.as_ref() == Some(key) {
                    self.oldest = newer.clone();
                }
            }
        }

        match &newer {
            Some(newer_key) => {
                self.entries.get_mut(newer_key).expect("chain link").older = older;
            }
            None => {
                if self.newest.as_ref() == Some(key) {
                    self.newest = older;
                }
            }
        }
    }

    fn make_newest(&mut self, key: &K) {
        if let Some(old_newest) = self.newest.clone() {
            self.entries.get_mut(&old_newest).expect("chain link").newer = Some(key.clone());
            self.entries.get_mut(key).expect("entry present").older = Some(old_newest);
        }

        self.newest = Some(key.clone());

        if self.oldest.is_none() {
            self.oldest = Some(key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn newest_to_oldest(map: &LruCacheMap<String, i32>) -> Vec<String> {
        let mut keys = Vec::new();
        map.for_each_newest(|k, _| keys.push(k.clone()));
        keys
    }

    fn oldest_to_newest(map: &LruCacheMap<String, i32>) -> Vec<String> {
        let mut keys = Vec::new();
        map.for_each_oldest(|k, _| keys.push(k.clone()));
        keys
    }

    fn insert(map: &mut LruCacheMap<String, i32>, key: &str, value: i32) {
        *map.get_or_default(&key.to_string()) = value;
    }

    fn check_chain(map: &LruCacheMap<String, i32>) {
        let mut forward = newest_to_oldest(map);
        let backward = oldest_to_newest(map);

        assert_eq!(forward.len(), map.len());
        forward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn eviction_without_predicate() {
        let mut map = LruCacheMap::new(5);

        insert(&mut map, "e1", 1);
        insert(&mut map, "e2", 2);
        insert(&mut map, "e3", 101);
        insert(&mut map, "e4", 102);
        assert_eq!(newest_to_oldest(&map), ["e4", "e3", "e2", "e1"]);
        check_chain(&map);

        insert(&mut map, "e5", 200);
        insert(&mut map, "e6", 300);
        assert_eq!(newest_to_oldest(&map), ["e6", "e5", "e4", "e3", "e2"]);
        check_chain(&map);

        map.get_or_default(&"e2".to_string());
        assert_eq!(newest_to_oldest(&map), ["e2", "e6", "e5", "e4", "e3"]);
        check_chain(&map);
    }

    #[test]
    fn eviction_skips_unremovable_entries() {
        fn removable(v: &i32) -> bool {
            *v > 100
        }

        let mut map = LruCacheMap::with_removability(5, removable);

        insert(&mut map, "e1", 1);
        insert(&mut map, "e2", 2);
        insert(&mut map, "e3", 101);
        insert(&mut map, "e4", 102);
        insert(&mut map, "e5", 200);
        insert(&mut map, "e6", 300);

        // e1 and e2 are pinned; e3 is the oldest removable entry.
        assert_eq!(oldest_to_newest(&map), ["e1", "e2", "e4", "e5", "e6"]);
        check_chain(&map);
    }

    #[test]
    fn no_removable_entries_means_growth() {
        fn removable(_: &i32) -> bool {
            false
        }

        let mut map = LruCacheMap::with_removability(2, removable);

        for i in 0..10 {
            insert(&mut map, &format!("e{i}"), i);
        }

        assert_eq!(map.len(), 10);
        check_chain(&map);
    }

    #[test]
    fn bounded_when_everything_is_removable() {
        let mut map = LruCacheMap::new(3);

        for i in 0..50 {
            insert(&mut map, &format!("e{i}"), i);
            assert!(map.len() <= 3);
            check_chain(&map);
        }
    }

    #[test]
    fn find_does_not_touch_recency() {
        let mut map = LruCacheMap::new(3);

        insert(&mut map, "a", 1);
        insert(&mut map, "b", 2);

        assert_eq!(map.find(&"a".to_string()), Some(1));
        assert_eq!(newest_to_oldest(&map), ["b", "a"]);

        assert_eq!(map.find(&"missing".to_string()), None);
    }

    #[test]
    fn erase_relinks_neighbors() {
        let mut map = LruCacheMap::new(5);

        insert(&mut map, "a", 1);
        insert(&mut map, "b", 2);
        insert(&mut map, "c", 3);

        map.erase(&"b".to_string());
        assert_eq!(newest_to_oldest(&map), ["c", "a"]);
        check_chain(&map);

        map.erase(&"zzz".to_string());
        assert_eq!(map.len(), 2);
    }
}
