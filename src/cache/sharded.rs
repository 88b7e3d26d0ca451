// Hash-sharded wrapper: the top bits of the 32-bit key hash select a
// shard, so keys partition cleanly and no operation ever holds two shard
// locks. The total charge is split across shards by ceiling division.

use crate::cache::lru::{CacheHandle, LruCache};
use crate::util::hash::hash32;

const HASH_SEED: u32 = 0;

/// Default number of shard-selection bits (16 shards).
pub const DEFAULT_SHARD_BITS: u32 = 4;

pub struct ShardedLruCache<V> {
    shards: Vec<LruCache<V>>,
    shard_bits: u32,
}

impl<V> ShardedLruCache<V> {
    pub fn new(total_charge: usize, shard_bits: u32) -> Self {
        Self::with_expansion(total_charge, shard_bits, 0.8, 2)
    }

    pub fn with_expansion(
        total_charge: usize,
        shard_bits: u32,
        expand_ratio: f64,
        expand_factor: usize,
    ) -> Self {
        assert!(total_charge > 0);
        assert!(shard_bits < 32);
        let count = 1usize << shard_bits;
        let per_shard = total_charge.div_ceil(count);
        let shards = (0..count)
            .map(|_| LruCache::with_expansion(per_shard, expand_ratio, expand_factor))
            .collect();
        Self { shards, shard_bits }
    }

    fn shard_of(&self, hash: u32) -> usize {
        if self.shard_bits == 0 {
            0
        } else {
            (hash >> (32 - self.shard_bits)) as usize
        }
    }

    pub fn insert(&self, key: &[u8], value: V, charge: usize) -> Option<CacheHandle<V>> {
        let hash = hash32(key, HASH_SEED);
        self.shards[self.shard_of(hash)].insert_with_hash(key, hash, value, charge)
    }

    pub fn lookup(&self, key: &[u8]) -> Option<CacheHandle<V>> {
        let hash = hash32(key, HASH_SEED);
        self.shards[self.shard_of(hash)].lookup(key)
    }

    pub fn release(&self, handle: CacheHandle<V>) {
        let shard = self.shard_of(handle.hash());
        self.shards[shard].release(handle)
    }

    pub fn erase(&self, key: &[u8]) -> bool {
        let hash = hash32(key, HASH_SEED);
        self.shards[self.shard_of(hash)].erase(key)
    }

    pub fn prune(&self) {
        for shard in &self.shards {
            shard.prune();
        }
    }

    pub fn total_usage(&self) -> usize {
        self.shards.iter().map(|s| s.total_usage()).sum()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, index: usize) -> &LruCache<V> {
        &self.shards[index]
    }
}
