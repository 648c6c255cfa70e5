//! The sharded, concurrent key directory.

use std::collections::HashMap;
use std::sync::RwLock;

/// Points at the value bytes of the latest accepted write for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub segment_id: u32,
    pub value_offset: u64,
    pub value_size: u32,
}

/// FNV-1a, 32-bit variant. Used purely to partition keys across shards; the
/// choice of hash and modulus affects lock contention, not correctness.
pub(crate) fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

struct Shard {
    map: RwLock<HashMap<Vec<u8>, DirEntry>>,
}

/// A mapping from key to [`DirEntry`], partitioned across a fixed number of
/// independently lock-protected shards. A key's shard is determined solely
/// by `fnv1a32(key) % num_shards`, so reads and writes against distinct
/// shards never contend.
pub struct ShardedIndex {
    shards: Vec<Shard>,
}

impl ShardedIndex {
    /// Builds an index with `num_shards` shards. `num_shards` must be at
    /// least 1.
    pub fn new(num_shards: usize) -> Self {
        assert!(num_shards > 0, "num_shards must be positive");
        let shards = (0..num_shards).map(|_| Shard { map: RwLock::new(HashMap::new()) }).collect();
        Self { shards }
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        let index = (fnv1a32(key) as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Inserts or overwrites the entry for `key`.
    pub fn put(&self, key: Vec<u8>, entry: DirEntry) {
        let shard = self.shard_for(&key);
        shard.map.write().expect("index shard lock poisoned").insert(key, entry);
    }

    /// Returns a copy of the entry for `key`, if present.
    pub fn get(&self, key: &[u8]) -> Option<DirEntry> {
        let shard = self.shard_for(key);
        shard.map.read().expect("index shard lock poisoned").get(key).copied()
    }

    /// Removes the entry for `key`, returning whether one was present.
    pub fn remove(&self, key: &[u8]) -> bool {
        let shard = self.shard_for(key);
        shard.map.write().expect("index shard lock poisoned").remove(key).is_some()
    }

    /// Sum of per-shard key counts. Acquires each shard's lock in turn, so
    /// this is exact only in the absence of concurrent mutation; under
    /// concurrency it is a point-in-time approximation, not a linearizable
    /// snapshot across shards.
    pub fn count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.map.read().expect("index shard lock poisoned").len())
            .sum()
    }
}
