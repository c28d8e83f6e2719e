use std::collections::{BTreeMap, HashMap};

use crate::Key;

/// A resident vector in the in-memory tier.
#[derive(Debug)]
pub(crate) struct Entry {
    pub data: Box<[f32]>,
    pub dirty: bool,
    tick: u64,
}

/// The bounded in-memory tier of a store, ordered by recency of use.
///
/// Every touch moves the entry to the most recent tick, `lru` always yields the
/// least recently touched resident key.
#[derive(Debug, Default)]
pub(crate) struct CacheTier {
    entries: HashMap<Key, Entry>,
    recency: BTreeMap<u64, Key>,
    tick: u64,
}

impl CacheTier {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, key: Key) -> bool {
        self.entries.contains_key(&key)
    }

    /// Marks `key` as most recently used and returns its stored data.
    pub fn touch(&mut self, key: Key) -> Option<&[f32]> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(&key)?;

        self.recency.remove(&entry.tick);
        self.recency.insert(tick, key);
        entry.tick = tick;

        Some(&entry.data)
    }

    /// Inserts or replaces `key`, the entry becomes the most recently used one.
    pub fn put(&mut self, key: Key, data: Box<[f32]>, dirty: bool) {
        let tick = self.next_tick();
        let entry = Entry { data, dirty, tick };

        if let Some(old) = self.entries.insert(key, entry) {
            self.recency.remove(&old.tick);
        }

        self.recency.insert(tick, key);
    }

    /// Returns the least recently touched key.
    pub fn lru(&self) -> Option<Key> {
        self.recency.values().next().copied()
    }

    pub fn get(&self, key: Key) -> Option<&Entry> {
        self.entries.get(&key)
    }

    pub fn remove(&mut self, key: Key) -> Option<Entry> {
        let entry = self.entries.remove(&key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    pub fn mark_clean(&mut self, key: Key) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.dirty = false;
        }
    }

    pub fn dirty_keys(&self) -> Vec<Key> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(&key, _)| key)
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.entries.keys().copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(v: f32) -> Box<[f32]> {
        vec![v].into_boxed_slice()
    }

    #[test]
    fn test_lru_follows_touch_order() {
        let mut tier = CacheTier::default();
        tier.put(1, data(1.), false);
        tier.put(2, data(2.), false);
        tier.put(3, data(3.), false);
        assert_eq!(tier.lru(), Some(1));

        tier.touch(1);
        assert_eq!(tier.lru(), Some(2));

        tier.remove(2);
        assert_eq!(tier.lru(), Some(3));
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_replace_moves_entry_to_front() {
        let mut tier = CacheTier::default();
        tier.put(1, data(1.), false);
        tier.put(2, data(2.), false);
        tier.put(1, data(10.), true);

        assert_eq!(tier.lru(), Some(2));
        assert_eq!(&*tier.get(1).unwrap().data, &[10.]);
        assert!(tier.get(1).unwrap().dirty);
    }

    #[test]
    fn test_mark_clean_clears_dirty_keys() {
        let mut tier = CacheTier::default();
        tier.put(4, data(1.), true);
        tier.put(5, data(1.), false);
        assert_eq!(tier.dirty_keys(), vec![4]);

        tier.mark_clean(4);
        assert!(tier.dirty_keys().is_empty());
    }
}
