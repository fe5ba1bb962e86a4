//! An extendible hash table, used by the buffer pool as its page directory.
//!
//! The directory is an array of `2^global_depth` slots, each referencing a
//! bucket by index into a bucket arena. Several slots may reference the
//! same bucket; the slots pointing at a bucket agree on its low
//! `local_depth` hash bits. A full bucket either forces the directory to
//! double or splits into a sibling one bit deeper, so growth never touches
//! more than two buckets at a time.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

struct Bucket<K, V> {
    local_depth: usize,
    entries: Vec<(K, V)>,
}

impl<K: Eq, V> Bucket<K, V> {
    fn new(capacity: usize, local_depth: usize) -> Self {
        Bucket {
            local_depth,
            entries: Vec::with_capacity(capacity),
        }
    }

    fn find(&self, key: &K) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn remove(&mut self, key: &K) -> bool {
        match self.entries.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Overwrites on a duplicate key. A new key only fits while the bucket
    /// is below `capacity`; a full bucket hands the pair back so the
    /// caller can split and retry.
    fn put(&mut self, capacity: usize, key: K, value: V) -> Result<(), (K, V)> {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
            return Ok(());
        }
        if self.entries.len() >= capacity {
            return Err((key, value));
        }
        self.entries.push((key, value));
        Ok(())
    }
}

struct TableState<K, V> {
    global_depth: usize,
    /// Directory slot -> bucket index. Always `2^global_depth` long.
    directory: Vec<usize>,
    buckets: Vec<Bucket<K, V>>,
}

pub struct ExtendibleHashTable<K, V, S = RandomState> {
    state: Mutex<TableState<K, V>>,
    bucket_capacity: usize,
    hash_builder: S,
}

impl<K: Hash + Eq, V: Clone> ExtendibleHashTable<K, V> {
    pub fn new(bucket_capacity: usize) -> Self {
        Self::with_hasher(bucket_capacity, RandomState::new())
    }
}

impl<K: Hash + Eq, V: Clone, S: BuildHasher> ExtendibleHashTable<K, V, S> {
    pub fn with_hasher(bucket_capacity: usize, hash_builder: S) -> Self {
        assert!(bucket_capacity >= 1, "bucket capacity must be positive");
        ExtendibleHashTable {
            state: Mutex::new(TableState {
                global_depth: 0,
                directory: vec![0],
                buckets: vec![Bucket::new(bucket_capacity, 0)],
            }),
            bucket_capacity,
            hash_builder,
        }
    }

    fn hash(&self, key: &K) -> usize {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish() as usize
    }

    fn lock_state(&self) -> MutexGuard<'_, TableState<K, V>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let hash = self.hash(key);
        let state = self.lock_state();
        let slot = hash & ((1 << state.global_depth) - 1);
        state.buckets[state.directory[slot]].find(key).cloned()
    }

    pub fn remove(&self, key: &K) -> bool {
        let hash = self.hash(key);
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let slot = hash & ((1 << state.global_depth) - 1);
        let bucket = state.directory[slot];
        state.buckets[bucket].remove(key)
    }

    pub fn insert(&self, key: K, value: V) {
        let hash = self.hash(&key);
        let mut guard = self.lock_state();
        let state = &mut *guard;

        // One split is not always enough: every entry of the overfull
        // bucket can rehash to the same side, so keep doubling or
        // splitting until the key fits.
        let (mut key, mut value) = (key, value);
        loop {
            let slot = hash & ((1 << state.global_depth) - 1);
            let bucket = state.directory[slot];
            match state.buckets[bucket].put(self.bucket_capacity, key, value) {
                Ok(()) => return,
                Err(returned) => (key, value) = returned,
            }

            if state.buckets[bucket].local_depth == state.global_depth {
                // Doubling: slot `i + old_size` starts out referencing the
                // same bucket as slot `i`, so no binding changes yet.
                state.global_depth += 1;
                let doubled = state.directory.clone();
                state.directory.extend(doubled);
            } else {
                self.split_bucket(state, bucket);
            }
        }
    }

    /// Splits `bucket` one bit deeper: entries whose hash disagrees with
    /// the bucket's residue under the widened mask move to a freshly
    /// allocated sibling, and the directory slots that now belong to the
    /// sibling are rebound.
    fn split_bucket(&self, state: &mut TableState<K, V>, bucket: usize) {
        state.buckets[bucket].local_depth += 1;
        let depth = state.buckets[bucket].local_depth;

        let old_mask = (1 << (depth - 1)) - 1;
        let new_mask = (1 << depth) - 1;
        // The residue every slot pointing here shares, taken before
        // redistribution can empty the bucket.
        let residue = self.hash(&state.buckets[bucket].entries[0].0) & old_mask;

        let sibling = state.buckets.len();
        let mut sibling_bucket = Bucket::new(self.bucket_capacity, depth);
        let entries = std::mem::take(&mut state.buckets[bucket].entries);
        for (key, value) in entries {
            if self.hash(&key) & new_mask != residue {
                sibling_bucket.entries.push((key, value));
            } else {
                state.buckets[bucket].entries.push((key, value));
            }
        }
        state.buckets.push(sibling_bucket);

        for (slot, target) in state.directory.iter_mut().enumerate() {
            if slot & old_mask == residue && slot & new_mask != residue {
                *target = sibling;
            }
        }
    }

    pub fn global_depth(&self) -> usize {
        self.lock_state().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> usize {
        let state = self.lock_state();
        state.buckets[state.directory[dir_index]].local_depth
    }

    pub fn num_buckets(&self) -> usize {
        self.lock_state().buckets.len()
    }

    /// Checks the structural invariants: directory length is
    /// `2^global_depth`, local depths never exceed the global depth, and
    /// all slots referencing a bucket agree on its low `local_depth` bits.
    #[cfg(test)]
    fn assert_directory_invariants(&self) {
        let state = self.lock_state();
        assert_eq!(state.directory.len(), 1 << state.global_depth);

        for (slot, &bucket) in state.directory.iter().enumerate() {
            let depth = state.buckets[bucket].local_depth;
            assert!(depth <= state.global_depth);

            let mask = (1 << depth) - 1;
            for (other_slot, &other_bucket) in state.directory.iter().enumerate() {
                if other_bucket == bucket {
                    assert_eq!(
                        slot & mask,
                        other_slot & mask,
                        "slots {slot} and {other_slot} share a bucket but disagree on its residue"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hashes a `u64` key to itself, so bucket placement is decided by the
    /// key's own low bits.
    #[derive(Clone, Default)]
    struct IdentityState;

    struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }

        fn write(&mut self, _bytes: &[u8]) {
            unreachable!("identity hashing is only defined for u64 keys");
        }

        fn write_u64(&mut self, n: u64) {
            self.0 = n;
        }
    }

    impl BuildHasher for IdentityState {
        type Hasher = IdentityHasher;

        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher(0)
        }
    }

    fn identity_table(bucket_capacity: usize) -> ExtendibleHashTable<u64, u64, IdentityState> {
        ExtendibleHashTable::with_hasher(bucket_capacity, IdentityState)
    }

    #[test]
    fn insert_find_overwrite_remove() {
        let table: ExtendibleHashTable<u32, String> = ExtendibleHashTable::new(4);

        table.insert(1, "one".to_string());
        table.insert(2, "two".to_string());
        assert_eq!(table.find(&1).as_deref(), Some("one"));
        assert_eq!(table.find(&3), None);

        table.insert(1, "uno".to_string());
        assert_eq!(table.find(&1).as_deref(), Some("uno"));

        assert!(table.remove(&1));
        assert!(!table.remove(&1));
        assert_eq!(table.find(&1), None);
        assert_eq!(table.find(&2).as_deref(), Some("two"));
    }

    #[test]
    fn third_key_doubles_the_directory() {
        let table = identity_table(2);
        assert_eq!(table.global_depth(), 0);

        table.insert(0b00, 0);
        table.insert(0b01, 1);
        assert_eq!(table.global_depth(), 0);
        assert_eq!(table.num_buckets(), 1);

        // The sole bucket is full; the split separates on bit 0.
        table.insert(0b10, 2);
        assert_eq!(table.global_depth(), 1);
        assert_eq!(table.num_buckets(), 2);
        assert_eq!(table.local_depth(0), 1);
        assert_eq!(table.local_depth(1), 1);

        assert_eq!(table.find(&0b00), Some(0));
        assert_eq!(table.find(&0b01), Some(1));
        assert_eq!(table.find(&0b10), Some(2));
        table.assert_directory_invariants();
    }

    #[test]
    fn keys_rehashing_to_one_side_keep_splitting() {
        let table = identity_table(2);

        // 0 and 4 agree on the two low bits, 8 agrees with both up to bit
        // 2, so the insert has to deepen the directory until bit 2 tells
        // them apart.
        table.insert(0, 0);
        table.insert(4, 4);
        table.insert(8, 8);

        assert_eq!(table.global_depth(), 3);
        assert_eq!(table.find(&0), Some(0));
        assert_eq!(table.find(&4), Some(4));
        assert_eq!(table.find(&8), Some(8));
        table.assert_directory_invariants();
    }

    #[test]
    fn removal_never_shrinks_the_directory() {
        let table = identity_table(1);
        for key in 0..8u64 {
            table.insert(key, key);
        }
        let depth_before = table.global_depth();
        let buckets_before = table.num_buckets();

        for key in 0..8u64 {
            assert!(table.remove(&key));
        }

        assert_eq!(table.global_depth(), depth_before);
        assert_eq!(table.num_buckets(), buckets_before);
        table.assert_directory_invariants();
    }

    #[test]
    fn random_workload_upholds_directory_invariants() {
        let table: ExtendibleHashTable<u64, u64> = ExtendibleHashTable::new(3);

        for key in 0..500u64 {
            table.insert(key, key * 10);
        }
        table.assert_directory_invariants();

        for key in (0..500u64).step_by(2) {
            assert!(table.remove(&key));
        }
        table.assert_directory_invariants();

        for key in 0..500u64 {
            let expected = (key % 2 == 1).then_some(key * 10);
            assert_eq!(table.find(&key), expected);
        }
    }
}
