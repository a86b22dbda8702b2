//! Router-side prefix cache index: tracks which instances likely already
//! hold which block hashes resident, used by prefix-affinity routing.
//! Deliberately separate from the per-instance KV store's own hash index —
//! this one never allocates, it only remembers observations.

use std::collections::HashMap;

use crate::clock::Tick;
use crate::kv::block::{compute_block_hashes, BlockHash};
use crate::request::{InstanceId, TokenId};

/// Per-instance LRU map `blockHash -> lastAccessTick`, capacity-bounded per
/// instance so total memory is `O(num_instances * capacity)` (INV-7).
pub struct PrefixCacheIndex {
    capacity_per_instance: usize,
    block_size: usize,
    maps: Vec<HashMap<BlockHash, Tick>>,
}

impl PrefixCacheIndex {
    pub fn new(num_instances: usize, capacity_per_instance: usize, block_size: usize) -> Self {
        Self {
            capacity_per_instance,
            block_size,
            maps: (0..num_instances).map(|_| HashMap::new()).collect(),
        }
    }

    pub fn compute_block_hashes(&self, tokens: &[TokenId]) -> Vec<BlockHash> {
        compute_block_hashes(tokens, self.block_size)
    }

    pub fn total_entries(&self) -> usize {
        self.maps.iter().map(|m| m.len()).sum()
    }

    /// Read-only membership check, used where a caller needs prefix-length
    /// matching without refreshing access ticks (e.g. pure scoring).
    pub fn contains(&self, hash: BlockHash, instance: InstanceId) -> bool {
        self.maps[instance].contains_key(&hash)
    }

    /// Longest consecutive prefix of `hashes` present in `instance`'s map.
    /// Matched entries' access ticks are refreshed.
    pub fn lookup(&mut self, hashes: &[BlockHash], instance: InstanceId, clock: Tick) -> usize {
        let map = &mut self.maps[instance];
        let mut count = 0;
        for h in hashes {
            if map.contains_key(h) {
                map.insert(*h, clock);
                count += 1;
            } else {
                break;
            }
        }
        count
    }

    /// Inserts every hash into `instance`'s map, evicting the stalest entry
    /// (tie-break: oldest tick, then smallest hash — INV-3) whenever
    /// capacity is exceeded.
    pub fn record(&mut self, hashes: &[BlockHash], instance: InstanceId, clock: Tick) {
        let capacity = self.capacity_per_instance;
        let map = &mut self.maps[instance];
        for h in hashes {
            map.insert(*h, clock);
            while map.len() > capacity {
                let evict = map
                    .iter()
                    .min_by_key(|(&h, &t)| (t, h))
                    .map(|(&h, _)| h);
                if let Some(h) = evict {
                    map.remove(&h);
                } else {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_stops_at_first_miss() {
        let mut idx = PrefixCacheIndex::new(2, 100, 4);
        let hashes = idx.compute_block_hashes(&(0..16).collect::<Vec<_>>());
        idx.record(&hashes[..2], 0, Tick(1));
        assert_eq!(idx.lookup(&hashes, 0, Tick(2)), 2);
    }

    #[test]
    fn capacity_is_enforced_per_instance() {
        let mut idx = PrefixCacheIndex::new(1, 2, 4);
        let hashes = idx.compute_block_hashes(&(0..16).collect::<Vec<_>>());
        idx.record(&hashes, 0, Tick(1)); // 4 hashes, capacity 2
        assert_eq!(idx.total_entries(), 2);
    }

    #[test]
    fn eviction_prefers_oldest_tick() {
        let mut idx = PrefixCacheIndex::new(1, 1, 4);
        let hashes = idx.compute_block_hashes(&(0..16).collect::<Vec<_>>());
        idx.record(&hashes[..1], 0, Tick(1));
        idx.record(&hashes[1..2], 0, Tick(5));
        // only the second (newer) entry should survive
        assert_eq!(idx.lookup(&hashes[1..2], 0, Tick(10)), 1);
        assert_eq!(idx.lookup(&hashes[..1], 0, Tick(10)), 0);
    }
}
