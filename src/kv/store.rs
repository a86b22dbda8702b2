//! The KV block store: a fixed-size block pool with an LRU free list, a
//! block-hash prefix index for cache reuse, and transactional allocation
//! with full rollback on failure.
//!
//! Grounded on the teacher's `cache::pager::Pager` (central block table +
//! per-tier accounting) but replaces attention-score eviction with the
//! spec's block-hash prefix cache and adds the transactional allocate path
//! the teacher never needed (it only ever inserted fresh blocks).

use std::collections::{HashMap, VecDeque};

use crate::clock::Tick;
use crate::kv::block::{compute_block_hashes, hash_chunk, BlockHash, BlockId, KvBlock, CHAIN_SEED};
use crate::request::{div_ceil, Request, RequestId, TokenId};

/// Outcome of an allocation attempt. `cache_hits` counts blocks reused via
/// prefix match — incremented here, at the allocation call site, never
/// inside the pure [`KvStore::get_cached_blocks`] query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocateOutcome {
    pub success: bool,
    pub cache_hits: usize,
}

impl AllocateOutcome {
    fn fail() -> Self {
        Self {
            success: false,
            cache_hits: 0,
        }
    }
}

/// Public contract shared by the single-tier store and the GPU/CPU
/// composition in [`crate::kv::tiered`].
pub trait KvStore {
    fn total_capacity(&self) -> usize;
    fn used_blocks(&self) -> usize;
    fn block_size(&self) -> usize;

    fn compute_block_hashes(&self, tokens: &[TokenId]) -> Vec<BlockHash> {
        compute_block_hashes(tokens, self.block_size())
    }

    /// Longest consecutive prefix of cached blocks for `tokens`. Pure: never
    /// mutates state, never counts a cache hit.
    fn get_cached_blocks(&self, tokens: &[TokenId]) -> Vec<BlockId>;

    fn allocate_kv_blocks(
        &mut self,
        req: &Request,
        start_index: usize,
        end_index: usize,
        cached_blocks: &[BlockId],
    ) -> AllocateOutcome;

    fn release_kv_blocks(&mut self, req_id: RequestId);

    /// No-op for the single-tier store; the tiered store uses this to keep
    /// its internal clock current for transfer-latency accounting.
    fn set_clock(&mut self, _now: Tick) {}

    /// Always `0` for the single-tier store.
    fn pending_transfer_latency(&self) -> u64 {
        0
    }

    /// Returns and clears the accumulated transfer latency. Called exactly
    /// once per step by the engine.
    fn consume_pending_transfer_latency(&mut self) -> u64 {
        0
    }

    /// `UsedBlocks + |FreeList| == TotalCapacity` must hold at every
    /// operation boundary (INV-4). A violation is internal-state corruption,
    /// not a recoverable error — panics with the full accounting state.
    fn assert_conservation(&self);
}

#[derive(Debug, Clone)]
struct BlockSnapshot {
    id: BlockId,
    prev: KvBlock,
}

#[derive(Debug)]
enum UndoOp {
    RestoreBlock(BlockSnapshot),
    PushFrontFreeList(BlockId),
    RemoveHashIndex(BlockHash),
    ReinsertHashIndex(BlockHash, BlockId),
}

/// A single-tier KV block pool.
#[derive(Debug)]
pub struct SingleTierStore {
    block_size: usize,
    blocks: Vec<KvBlock>,
    /// LRU-ordered: front is evicted/reused first, releases append to back.
    free_list: VecDeque<BlockId>,
    request_map: HashMap<RequestId, Vec<BlockId>>,
    hash_index: HashMap<BlockHash, BlockId>,
}

fn full_stream_token(req: &Request, pos: usize) -> TokenId {
    if pos < req.input_tokens.len() {
        req.input_tokens[pos]
    } else {
        req.output_tokens
            .get(pos - req.input_tokens.len())
            .copied()
            .unwrap_or(0)
    }
}

fn chain_seed_before(owned: &[BlockId], blocks: &[KvBlock]) -> u64 {
    for &id in owned.iter().rev() {
        if let Some(h) = blocks[id as usize].hash {
            return h.0;
        }
    }
    CHAIN_SEED
}

impl SingleTierStore {
    pub fn new(total_capacity: usize, block_size: usize) -> Self {
        let blocks = (0..total_capacity as BlockId)
            .map(KvBlock::new)
            .collect();
        let free_list = (0..total_capacity as BlockId).collect();
        Self {
            block_size,
            blocks,
            free_list,
            request_map: HashMap::new(),
            hash_index: HashMap::new(),
        }
    }

    pub fn owned_blocks(&self, req_id: RequestId) -> &[BlockId] {
        self.request_map
            .get(&req_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn block(&self, id: BlockId) -> Option<&KvBlock> {
        self.blocks.get(id as usize)
    }

    pub fn find_hash(&self, h: BlockHash) -> Option<BlockId> {
        self.hash_index.get(&h).copied()
    }

    pub fn has_free(&self) -> bool {
        !self.free_list.is_empty()
    }

    pub fn peek_free_front(&self) -> Option<BlockId> {
        self.free_list.front().copied()
    }

    /// Writes `tokens`/`hash` into a free block without touching ref counts
    /// — used by [`crate::kv::tiered::TieredStore`] to migrate content
    /// between tiers outside of the request-driven allocate path. The block
    /// stays in the free list (at the tail) so it remains reusable either as
    /// plain capacity or, if its hash matches a future request, as a cache
    /// hit.
    pub fn adopt_free_block(&mut self, tokens: Vec<TokenId>, hash: Option<BlockHash>) -> Option<BlockId> {
        let id = self.free_list.pop_front()?;
        let block = &mut self.blocks[id as usize];
        block.reset();
        block.tokens = tokens;
        block.hash = hash;
        if let Some(h) = hash {
            self.hash_index.entry(h).or_insert(id);
        }
        self.free_list.push_back(id);
        Some(id)
    }

    /// Clears a free block's content and hash-index entry, reclaiming it as
    /// plain capacity. Does not touch free-list membership.
    pub fn clear_block(&mut self, id: BlockId) {
        if let Some(h) = self.blocks[id as usize].hash {
            if self.hash_index.get(&h) == Some(&id) {
                self.hash_index.remove(&h);
            }
        }
        self.blocks[id as usize].tokens.clear();
        self.blocks[id as usize].hash = None;
    }

    /// Writes `tokens`/`hash` back into a specific free block, undoing a
    /// prior [`SingleTierStore::clear_block`] or tier-migration mutation on
    /// that same id. Does not touch free-list membership, same as
    /// `clear_block`/`adopt_free_block` — used by
    /// [`crate::kv::tiered::TieredStore`] to roll back a partially reloaded
    /// transfer when the overall allocation fails.
    pub fn restore_block_content(&mut self, id: BlockId, tokens: Vec<TokenId>, hash: Option<BlockHash>) {
        if let Some(h) = self.blocks[id as usize].hash {
            if self.hash_index.get(&h) == Some(&id) {
                self.hash_index.remove(&h);
            }
        }
        self.blocks[id as usize].tokens = tokens;
        self.blocks[id as usize].hash = hash;
        if let Some(h) = hash {
            self.hash_index.entry(h).or_insert(id);
        }
    }

    fn remove_from_free_list(&mut self, id: BlockId) -> bool {
        if let Some(pos) = self.free_list.iter().position(|&b| b == id) {
            self.free_list.remove(pos);
            true
        } else {
            false
        }
    }

    fn apply_undo(&mut self, op: UndoOp) {
        match op {
            UndoOp::RestoreBlock(snap) => {
                self.blocks[snap.id as usize] = snap.prev;
            }
            UndoOp::PushFrontFreeList(id) => self.free_list.push_front(id),
            UndoOp::RemoveHashIndex(h) => {
                self.hash_index.remove(&h);
            }
            UndoOp::ReinsertHashIndex(h, id) => {
                self.hash_index.insert(h, id);
            }
        }
    }
}

impl KvStore for SingleTierStore {
    fn total_capacity(&self) -> usize {
        self.blocks.len()
    }

    fn used_blocks(&self) -> usize {
        self.blocks.len() - self.free_list.len()
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn get_cached_blocks(&self, tokens: &[TokenId]) -> Vec<BlockId> {
        let hashes = compute_block_hashes(tokens, self.block_size);
        let mut result = Vec::new();
        for h in hashes {
            match self.hash_index.get(&h) {
                Some(&id) => result.push(id),
                None => break,
            }
        }
        result
    }

    fn allocate_kv_blocks(
        &mut self,
        req: &Request,
        start_index: usize,
        end_index: usize,
        cached_blocks: &[BlockId],
    ) -> AllocateOutcome {
        if end_index <= start_index {
            return AllocateOutcome {
                success: true,
                cache_hits: 0,
            };
        }
        let block_size = self.block_size;
        let mut undo: Vec<UndoOp> = Vec::new();
        let mut cache_hits = 0usize;
        let mut new_owned: Vec<BlockId> = Vec::new();

        let owned_before = self
            .request_map
            .get(&req.id)
            .cloned()
            .unwrap_or_default();

        // Phase A: fill the partial tail block first, if one exists.
        let mut cursor = start_index;
        if let Some(&tail_id) = owned_before.last() {
            let tail_len = self.blocks[tail_id as usize].tokens.len();
            if tail_len < block_size {
                let cap_left = block_size - tail_len;
                let fill = cap_left.min(end_index - cursor);
                if fill > 0 {
                    let snapshot = self.blocks[tail_id as usize].clone();
                    for pos in cursor..cursor + fill {
                        let tok = full_stream_token(req, pos);
                        self.blocks[tail_id as usize].tokens.push(tok);
                    }
                    undo.push(UndoOp::RestoreBlock(BlockSnapshot {
                        id: tail_id,
                        prev: snapshot,
                    }));
                    cursor += fill;
                    if self.blocks[tail_id as usize].tokens.len() == block_size {
                        let seed = chain_seed_before(
                            &owned_before[..owned_before.len() - 1],
                            &self.blocks,
                        );
                        let hash = hash_chunk(seed, &self.blocks[tail_id as usize].tokens);
                        self.blocks[tail_id as usize].hash = Some(hash);
                        if !self.hash_index.contains_key(&hash) {
                            self.hash_index.insert(hash, tail_id);
                            undo.push(UndoOp::RemoveHashIndex(hash));
                        }
                    }
                }
            }
        }

        // Phase B: recompute remaining tokens (avoids phantom empty-tail
        // allocations once the tail fill above has consumed the budget).
        let remaining_start = cursor;
        let remaining_len = end_index - remaining_start;
        let num_new_blocks = div_ceil(remaining_len, block_size);

        let mut chain_seed = chain_seed_before(&owned_before, &self.blocks);

        let mut failed = false;
        for j in 0..num_new_blocks {
            let chunk_start = remaining_start + j * block_size;
            let chunk_end = (chunk_start + block_size).min(end_index);
            let chunk_len = chunk_end - chunk_start;
            let is_full = chunk_len == block_size;

            if is_full && j < cached_blocks.len() {
                let cand = cached_blocks[j];
                let chunk: Vec<TokenId> =
                    (chunk_start..chunk_end).map(|p| full_stream_token(req, p)).collect();
                let expected_hash = hash_chunk(chain_seed, &chunk);
                let matches = self
                    .blocks
                    .get(cand as usize)
                    .map(|b| b.hash == Some(expected_hash))
                    .unwrap_or(false);
                if !matches {
                    failed = true;
                    break;
                }
                let was_free = self.blocks[cand as usize].is_free();
                if was_free && !self.remove_from_free_list(cand) {
                    failed = true;
                    break;
                }
                if was_free {
                    undo.push(UndoOp::PushFrontFreeList(cand));
                }
                let prev = {
                    let mut b = self.blocks[cand as usize].clone();
                    b.ref_count = b.ref_count.saturating_sub(1);
                    b
                };
                self.blocks[cand as usize].ref_count += 1;
                undo.push(UndoOp::RestoreBlock(BlockSnapshot { id: cand, prev }));
                new_owned.push(cand);
                chain_seed = expected_hash.0;
                cache_hits += 1;
            } else {
                let new_id = match self.free_list.pop_front() {
                    Some(id) => id,
                    None => {
                        failed = true;
                        break;
                    }
                };
                undo.push(UndoOp::PushFrontFreeList(new_id));
                let prev_state = self.blocks[new_id as usize].clone();
                if let Some(old_hash) = prev_state.hash {
                    if self.hash_index.get(&old_hash) == Some(&new_id) {
                        self.hash_index.remove(&old_hash);
                        undo.push(UndoOp::ReinsertHashIndex(old_hash, new_id));
                    }
                }
                let block = &mut self.blocks[new_id as usize];
                block.reset();
                block.ref_count = 1;
                for p in chunk_start..chunk_end {
                    block.tokens.push(full_stream_token(req, p));
                }
                undo.push(UndoOp::RestoreBlock(BlockSnapshot {
                    id: new_id,
                    prev: prev_state,
                }));
                if is_full {
                    let hash = hash_chunk(chain_seed, &self.blocks[new_id as usize].tokens);
                    self.blocks[new_id as usize].hash = Some(hash);
                    if !self.hash_index.contains_key(&hash) {
                        self.hash_index.insert(hash, new_id);
                        undo.push(UndoOp::RemoveHashIndex(hash));
                    }
                    chain_seed = hash.0;
                }
                new_owned.push(new_id);
            }
        }

        if failed {
            for op in undo.into_iter().rev() {
                self.apply_undo(op);
            }
            self.assert_conservation();
            return AllocateOutcome::fail();
        }

        self.request_map.entry(req.id).or_default().extend(new_owned);
        self.assert_conservation();
        AllocateOutcome {
            success: true,
            cache_hits,
        }
    }

    fn release_kv_blocks(&mut self, req_id: RequestId) {
        if let Some(ids) = self.request_map.remove(&req_id) {
            for id in ids {
                let b = &mut self.blocks[id as usize];
                if b.ref_count > 0 {
                    b.ref_count -= 1;
                }
                if b.ref_count == 0 {
                    self.free_list.push_back(id);
                }
            }
        }
        self.assert_conservation();
    }

    fn assert_conservation(&self) {
        let total = self.blocks.len();
        let free = self.free_list.len();
        let used = total - free;
        if used + free != total {
            panic!(
                "KV conservation violated: used={used} free={free} total={total} \
                 (this is internal-state corruption, not a recoverable error)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Tick;
    use crate::request::SloClass;

    fn req(id: RequestId, input: usize, output: usize) -> Request {
        Request::new(
            id,
            Tick(0),
            (0..input as u32).collect(),
            vec![0; output],
            SloClass::Standard,
            0,
            0,
        )
    }

    #[test]
    fn allocate_and_release_conserves_blocks() {
        let mut store = SingleTierStore::new(10, 4);
        let r = req(1, 16, 1);
        let outcome = store.allocate_kv_blocks(&r, 0, 16, &[]);
        assert!(outcome.success);
        assert_eq!(store.used_blocks(), 4);
        store.release_kv_blocks(1);
        assert_eq!(store.used_blocks(), 0);
        assert_eq!(store.total_capacity(), store.used_blocks() + store.free_list.len());
    }

    #[test]
    fn cached_blocks_are_reused_and_counted() {
        let mut store = SingleTierStore::new(10, 4);
        let r1 = req(1, 16, 1);
        store.allocate_kv_blocks(&r1, 0, 16, &[]);

        let r2 = req(2, 16, 1);
        let cached = store.get_cached_blocks(&r2.input_tokens);
        assert_eq!(cached.len(), 4);
        let outcome = store.allocate_kv_blocks(&r2, 0, 16, &cached);
        assert!(outcome.success);
        assert_eq!(outcome.cache_hits, 4);
        // all four blocks are now shared between r1 and r2
        for &id in store.owned_blocks(2) {
            assert_eq!(store.block(id).unwrap().ref_count, 2);
        }
    }

    #[test]
    fn get_cached_blocks_is_pure() {
        let mut store = SingleTierStore::new(10, 4);
        let r1 = req(1, 16, 1);
        store.allocate_kv_blocks(&r1, 0, 16, &[]);

        let before = store.used_blocks();
        let a = store.get_cached_blocks(&r1.input_tokens);
        let b = store.get_cached_blocks(&r1.input_tokens);
        assert_eq!(a, b);
        assert_eq!(store.used_blocks(), before);
    }

    #[test]
    fn allocation_failure_rolls_back_completely() {
        let mut store = SingleTierStore::new(2, 4);
        let r1 = req(1, 8, 1); // uses both blocks
        assert!(store.allocate_kv_blocks(&r1, 0, 8, &[]).success);

        let free_before: Vec<BlockId> = store.free_list.iter().copied().collect();
        let r2 = req(2, 8, 1);
        let outcome = store.allocate_kv_blocks(&r2, 0, 8, &[]);
        assert!(!outcome.success);
        let free_after: Vec<BlockId> = store.free_list.iter().copied().collect();
        assert_eq!(free_before, free_after);
        assert!(store.owned_blocks(2).is_empty());
    }

    #[test]
    fn partial_tail_fill_then_new_allocation_adds_exactly_one_block() {
        let mut store = SingleTierStore::new(10, 4);
        let r = req(1, 6, 1); // 6 tokens: one full block + 2-token tail
        assert!(store.allocate_kv_blocks(&r, 0, 6, &[]).success);
        assert_eq!(store.used_blocks(), 2);

        // Extend to 8 tokens: should complete the tail block, no new block
        // needed (2 more tokens exactly fill the 2-token gap).
        let mut r8 = req(1, 8, 1);
        r8.progress_index = 6;
        let outcome = store.allocate_kv_blocks(&r8, 6, 8, &[]);
        assert!(outcome.success);
        assert_eq!(store.used_blocks(), 2);

        // Extend by one more token beyond the now-full 8: needs exactly one
        // new block, not two.
        let mut r9 = req(1, 9, 1);
        r9.progress_index = 8;
        let outcome = store.allocate_kv_blocks(&r9, 8, 9, &[]);
        assert!(outcome.success);
        assert_eq!(store.used_blocks(), 3);
    }

    #[test]
    fn release_appends_to_free_list_tail() {
        let mut store = SingleTierStore::new(4, 4);
        let r1 = req(1, 4, 1);
        let r2 = req(2, 4, 1);
        store.allocate_kv_blocks(&r1, 0, 4, &[]);
        store.allocate_kv_blocks(&r2, 0, 4, &[]);
        assert_eq!(store.free_list.len(), 2);
        store.release_kv_blocks(1);
        // the released block should now be at the tail, not the head.
        assert_eq!(*store.free_list.back().unwrap(), store.owned_blocks(1).get(0).copied().unwrap_or_default());
    }

    #[test]
    #[should_panic(expected = "KV conservation")]
    fn conservation_panics_on_corruption() {
        let store = SingleTierStore::new(4, 4);
        // Manually corrupt: duplicate a free block id to desync the count.
        let mut store = store;
        store.free_list.push_back(0);
        store.free_list.push_back(0);
        // force an inconsistent total via direct field access in-module test
        store.blocks.pop();
        store.assert_conservation();
    }
}
