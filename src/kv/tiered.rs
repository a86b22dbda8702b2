//! GPU/CPU tiered KV store composition.
//!
//! A fast GPU tier backs all live allocation; a slower CPU tier holds
//! opportunistically offloaded content so a request that returns to a prefix
//! it used earlier can reload it instead of recomputing prefill from
//! scratch. Reload costs a transfer-latency charge the engine consumes once
//! per step; offload is modeled as free background copy (it never blocks
//! the GPU's own progress).
//!
//! Grounded on the teacher's `cache::pager::Pager`, which owned exactly this
//! GPU-tier/CPU-tier split (`TierStats` per tier) and the same
//! bandwidth-plus-base-latency transfer cost shape the teacher charged for
//! `GpuTransfer` operations.

use crate::clock::Tick;
use crate::config::CpuTierConfig;
use crate::kv::block::{BlockHash, BlockId};
use crate::kv::store::{AllocateOutcome, KvStore, SingleTierStore};
use crate::request::{Request, RequestId, TokenId};

pub struct TieredStore {
    gpu: SingleTierStore,
    cpu: SingleTierStore,
    offload_threshold: f64,
    transfer_bandwidth: f64,
    transfer_base_latency: u64,
    pending_latency: u64,
    clock: Tick,
}

impl TieredStore {
    pub fn new(gpu_total_blocks: usize, block_size: usize, cpu: &CpuTierConfig) -> Self {
        Self {
            gpu: SingleTierStore::new(gpu_total_blocks, block_size),
            cpu: SingleTierStore::new(cpu.cpu_blocks, block_size),
            offload_threshold: cpu.offload_threshold,
            transfer_bandwidth: cpu.transfer_bandwidth,
            transfer_base_latency: cpu.transfer_base_latency,
            pending_latency: 0,
            clock: Tick::ZERO,
        }
    }

    fn gpu_total(&self) -> BlockId {
        self.gpu.total_capacity() as BlockId
    }

    fn latency_for(&self, reloaded_blocks: usize) -> u64 {
        if reloaded_blocks == 0 {
            return 0;
        }
        let transfer_ticks = (reloaded_blocks as f64 / self.transfer_bandwidth).ceil() as u64;
        reloaded_blocks as u64 * self.transfer_base_latency + transfer_ticks
    }

    /// Opportunistically copies the GPU tier's next eviction candidate into
    /// the CPU tier before its content is overwritten, if the GPU is under
    /// enough pressure to be worth the (free, non-blocking) copy.
    fn maybe_offload_one(&mut self) {
        let used_fraction = self.gpu.used_blocks() as f64 / self.gpu.total_capacity() as f64;
        if used_fraction < self.offload_threshold || !self.cpu.has_free() {
            return;
        }
        let Some(candidate) = self.gpu.peek_free_front() else {
            return;
        };
        let Some(block) = self.gpu.block(candidate) else {
            return;
        };
        if block.hash.is_none() {
            return;
        }
        self.cpu.adopt_free_block(block.tokens.clone(), block.hash);
    }

    /// Undoes a sequence of CPU-to-GPU reloads in reverse order: frees the
    /// adopted GPU block and restores the original content at its CPU slot.
    /// Symmetric with the `adopt_free_block`/`clear_block` pair performed
    /// while reloading, so a partially-reloaded transfer leaves no trace
    /// when the overall allocation fails.
    fn undo_reloads(&mut self, reloads: Vec<(BlockId, BlockId, Vec<TokenId>, Option<BlockHash>)>) {
        for (local, new_gpu_id, tokens, hash) in reloads.into_iter().rev() {
            self.gpu.clear_block(new_gpu_id);
            self.cpu.restore_block_content(local, tokens, hash);
        }
    }
}

impl KvStore for TieredStore {
    fn total_capacity(&self) -> usize {
        self.gpu.total_capacity()
    }

    fn used_blocks(&self) -> usize {
        self.gpu.used_blocks()
    }

    fn block_size(&self) -> usize {
        self.gpu.block_size()
    }

    fn get_cached_blocks(&self, tokens: &[TokenId]) -> Vec<BlockId> {
        let hashes = self.gpu.compute_block_hashes(tokens);
        let gpu_total = self.gpu_total();
        let mut result = Vec::new();
        for h in hashes {
            if let Some(id) = self.gpu.find_hash(h) {
                result.push(id);
            } else if let Some(local) = self.cpu.find_hash(h) {
                result.push(gpu_total + local);
            } else {
                break;
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
        self.maybe_offload_one();

        let gpu_total = self.gpu_total();
        let mut translated = Vec::with_capacity(cached_blocks.len());
        // (cpu local id, new gpu id, original tokens, original hash) for each
        // reload performed so far, so a later failure can undo them in order.
        let mut reloads: Vec<(BlockId, BlockId, Vec<TokenId>, Option<BlockHash>)> = Vec::new();
        let mut incomplete = false;
        for &id in cached_blocks {
            if id < gpu_total {
                translated.push(id);
                continue;
            }
            let local = id - gpu_total;
            let Some(block) = self.cpu.block(local) else {
                // Stale reference: the CPU slot no longer holds this content.
                // Stop translating and roll back any prior reloads instead of
                // handing a truncated list to the gpu allocate call.
                incomplete = true;
                break;
            };
            let tokens = block.tokens.clone();
            let hash = block.hash;
            match self.gpu.adopt_free_block(tokens.clone(), hash) {
                Some(new_gpu_id) => {
                    self.cpu.clear_block(local);
                    translated.push(new_gpu_id);
                    reloads.push((local, new_gpu_id, tokens, hash));
                }
                None => {
                    // GPU has no free capacity to reload into.
                    incomplete = true;
                    break;
                }
            }
        }

        if incomplete {
            self.undo_reloads(reloads);
            return AllocateOutcome { success: false, cache_hits: 0 };
        }

        let reloaded = reloads.len();
        let outcome = self.gpu.allocate_kv_blocks(req, start_index, end_index, &translated);
        if !outcome.success {
            self.undo_reloads(reloads);
            return outcome;
        }

        self.pending_latency += self.latency_for(reloaded);
        outcome
    }

    fn release_kv_blocks(&mut self, req_id: RequestId) {
        self.gpu.release_kv_blocks(req_id);
    }

    fn set_clock(&mut self, now: Tick) {
        self.clock = now;
    }

    fn pending_transfer_latency(&self) -> u64 {
        self.pending_latency
    }

    fn consume_pending_transfer_latency(&mut self) -> u64 {
        std::mem::take(&mut self.pending_latency)
    }

    fn assert_conservation(&self) {
        self.gpu.assert_conservation();
        self.cpu.assert_conservation();
    }
}
