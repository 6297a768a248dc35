use std::collections::hash_map::Entry;
use std::hash::Hash;

use ahash::{AHashMap, RandomState};
use parking_lot::RwLock;

/// Cache-line padding to prevent false sharing between shards.
#[repr(align(64))]
struct Shard<K, T> {
    map: RwLock<AHashMap<K, T>>,
}

/// A thread-safe table backed by `N` independently-locked shards.
///
/// Reads use a shared lock, writes an exclusive lock, both per-shard, so
/// `load` / `load_or_store` / `remove` are linearizable per key.  Values
/// are cheaply clonable handles (`Arc`s in practice); the table never
/// inspects them.
pub(crate) struct Shards<K, T> {
    shards: Box<[Shard<K, T>]>,
    /// Always `shards.len() - 1`; shards.len() is a power of two.
    shard_mask: usize,
    /// Hasher used only to compute shard indices.
    build_hasher: RandomState,
}

impl<K: Hash + Eq, T: Clone> Shards<K, T> {
    pub fn new(num_shards: usize) -> Self {
        assert!(num_shards.is_power_of_two());
        let shards = (0..num_shards)
            .map(|_| Shard {
                map: RwLock::new(AHashMap::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Shards {
            shards,
            shard_mask: num_shards - 1,
            build_hasher: RandomState::new(),
        }
    }

    #[inline]
    fn shard(&self, key: &K) -> &Shard<K, T> {
        let h = self.build_hasher.hash_one(key);
        // Use the high bits (better avalanche from ahash).
        &self.shards[((h >> 32) as usize) & self.shard_mask]
    }

    /// Returns a clone of the handle stored for `key`, if any.
    pub fn load(&self, key: &K) -> Option<T> {
        self.shard(key).map.read().get(key).cloned()
    }

    /// Returns the handle stored for `key`, inserting `make()` first if the
    /// key is vacant.  The second element is `true` when an existing handle
    /// was found.
    pub fn load_or_store(&self, key: K, make: impl FnOnce() -> T) -> (T, bool) {
        let mut map = self.shard(&key).map.write();
        match map.entry(key) {
            Entry::Occupied(slot) => (slot.get().clone(), true),
            Entry::Vacant(slot) => (slot.insert(make()).clone(), false),
        }
    }

    /// Removes the entry for `key`.  Returns the removed handle, if any.
    pub fn remove(&self, key: &K) -> Option<T> {
        self.shard(key).map.write().remove(key)
    }

    /// Returns the total number of entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.read().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn table() -> Shards<u64, Arc<u64>> {
        Shards::new(4)
    }

    #[test]
    fn load_misses_on_empty_table() {
        assert!(table().load(&1).is_none());
    }

    #[test]
    fn load_or_store_inserts_once() {
        let t = table();
        let (first, loaded) = t.load_or_store(1, || Arc::new(10));
        assert!(!loaded);
        let (second, loaded) = t.load_or_store(1, || Arc::new(99));
        assert!(loaded, "second lookup must find the stored handle");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, 10);
    }

    #[test]
    fn remove_clears_the_key() {
        let t = table();
        t.load_or_store(7, || Arc::new(70));
        assert_eq!(t.remove(&7).map(|v| *v), Some(70));
        assert!(t.load(&7).is_none());
        assert_eq!(t.len(), 0);
    }
}
