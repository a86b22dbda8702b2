//! Batch formation: the vLLM-style two-phase scheduling pass run once per
//! instance step. Continues already-running requests first, then dequeues
//! fresh ones from the wait queue against whatever token budget remains,
//! sharing a single preemption-aware allocator between both phases.
//!
//! Grounded on the teacher's `cache::pager` allocate-or-evict retry loop,
//! generalized from "evict by attention score" to "evict the running
//! batch's tail, FCFS-preserving."

use std::collections::BTreeMap;

use crate::clock::Tick;
use crate::kv::{BlockId, KvStore};
use crate::request::{div_ceil, Request, RequestId, RequestState};

#[derive(Debug, Clone)]
pub struct ScheduledRecord {
    pub request: Request,
    pub delay: u64,
}

#[derive(Debug, Clone)]
pub struct PreemptedRecord {
    pub request: Request,
    pub delay: u64,
}

#[derive(Debug)]
pub struct BatchResult {
    pub running_batch: Vec<Request>,
    pub newly_scheduled: Vec<ScheduledRecord>,
    pub preempted: Vec<PreemptedRecord>,
    pub preemption_happened: bool,
    /// Token budget left unspent at phase end — used by the engine's
    /// head-of-line blocking heuristic.
    pub remaining_budget: u64,
    /// Prefix-cache hits and total blocks attempted across this step's
    /// newly-dequeued requests only (Phase 1 continuations never consult the
    /// cache, so counting them would dilute the hit rate with blocks that
    /// were never cache-eligible in the first place).
    pub cache_hits: usize,
    pub blocks_requested: usize,
}

/// Everything batch formation needs and nothing it may reach past: no event
/// queue, no metrics handle, no clock beyond `now`.
pub struct BatchContext<'a> {
    pub kv: &'a mut dyn KvStore,
    pub wait_queue: Vec<Request>,
    pub computed_tokens: BTreeMap<RequestId, usize>,
    pub max_scheduled_tokens: u64,
    pub max_running_reqs: usize,
    pub long_prefill_token_threshold: usize,
    pub now: Tick,
    pub step_idx: u64,
    pub scheduling_processing_time: u64,
    pub preemption_processing_time: u64,
}

pub trait BatchFormation {
    fn form_batch(&self, running: Vec<Request>, ctx: &mut BatchContext<'_>) -> BatchResult;
}

/// Pops the tail of `batch`, releases its blocks, rewinds it to a fresh
/// queued state, and prepends it to the wait queue. Returns `false` (doing
/// nothing) when `batch` is already empty — the caller's circuit breaker.
fn evict_tail(batch: &mut Vec<Request>, ctx: &mut BatchContext<'_>, preempted: &mut Vec<PreemptedRecord>) -> bool {
    let mut victim = match batch.pop() {
        Some(r) => r,
        None => return false,
    };
    ctx.kv.release_kv_blocks(victim.id);
    ctx.computed_tokens.remove(&victim.id);
    victim.progress_index = 0;
    victim.num_new_tokens = 0;
    victim.state = RequestState::Queued;
    preempted.push(PreemptedRecord {
        request: victim.clone(),
        delay: ctx.preemption_processing_time,
    });
    ctx.wait_queue.insert(0, victim);
    true
}

/// Preemption-aware allocation for a request already occupying `batch[pos]`.
/// Eviction always targets the literal tail of `batch`; if `pos` itself is
/// the tail, eviction can remove the very request being grown, after which
/// its position vanishes and this returns `false` — a surprising but
/// deliberate consequence of sharing one "evict the tail" rule across both
/// phases, not a bug to paper over.
fn allocate_growing(
    batch: &mut Vec<Request>,
    req_id: RequestId,
    ctx: &mut BatchContext<'_>,
    preempted: &mut Vec<PreemptedRecord>,
    start: usize,
    end: usize,
) -> (bool, bool, usize) {
    let mut preemption_happened = false;
    loop {
        let pos = match batch.iter().position(|r| r.id == req_id) {
            Some(p) => p,
            None => return (false, preemption_happened, 0),
        };
        let outcome = ctx.kv.allocate_kv_blocks(&batch[pos], start, end, &[]);
        if outcome.success {
            return (true, preemption_happened, outcome.cache_hits);
        }
        if !evict_tail(batch, ctx, preempted) {
            return (false, preemption_happened, 0);
        }
        preemption_happened = true;
    }
}

/// Preemption-aware allocation for a candidate not yet in `batch` (Phase 2).
/// The candidate is never itself a target of `evict_tail`, so a dequeue
/// failure can only ever evict an already-running request, never the
/// candidate — matching the "FCFS: stop, don't touch candidate N+1" rule.
fn allocate_new(
    batch: &mut Vec<Request>,
    ctx: &mut BatchContext<'_>,
    preempted: &mut Vec<PreemptedRecord>,
    candidate: &Request,
    start: usize,
    end: usize,
    cached_blocks: &[BlockId],
) -> (bool, bool, usize) {
    let mut preemption_happened = false;
    loop {
        let outcome = ctx.kv.allocate_kv_blocks(candidate, start, end, cached_blocks);
        if outcome.success {
            return (true, preemption_happened, outcome.cache_hits);
        }
        if !evict_tail(batch, ctx, preempted) {
            return (false, preemption_happened, 0);
        }
        preemption_happened = true;
    }
}

fn clamped_chunk(remaining: usize, threshold: usize, budget: u64) -> usize {
    let capped_by_threshold = if threshold == 0 { remaining } else { remaining.min(threshold) };
    capped_by_threshold.min(budget as usize)
}

pub struct VllmBatchFormation;

impl BatchFormation for VllmBatchFormation {
    fn form_batch(&self, running: Vec<Request>, ctx: &mut BatchContext<'_>) -> BatchResult {
        let mut batch = running;
        let entry_order: Vec<RequestId> = batch.iter().map(|r| r.id).collect();
        let mut preempted = Vec::new();
        let mut newly_scheduled = Vec::new();
        let mut preemption_happened = false;
        let mut budget = ctx.max_scheduled_tokens;
        let mut cache_hits = 0usize;
        let mut blocks_requested = 0usize;

        // Phase 1: continue already-running requests, in the order they
        // held at entry. `batch` may shrink via preemption while this
        // iterates — later entries may already be gone by the time their
        // turn comes, and that's expected (see `allocate_growing`).
        for rid in entry_order {
            let pos = match batch.iter().position(|r| r.id == rid) {
                Some(p) => p,
                None => continue,
            };
            let prefill_remaining = batch[pos].input_tokens.len().saturating_sub(batch[pos].progress_index);

            if prefill_remaining > 0 {
                let num_new = clamped_chunk(prefill_remaining, ctx.long_prefill_token_threshold, budget);
                if num_new == 0 {
                    batch[pos].num_new_tokens = 0;
                    continue;
                }
                let start = batch[pos].progress_index;
                let end = start + num_new;
                let (ok, preempted_any, _hits) = allocate_growing(&mut batch, rid, ctx, &mut preempted, start, end);
                preemption_happened |= preempted_any;
                if ok {
                    budget = budget.saturating_sub(num_new as u64);
                    if let Some(p2) = batch.iter().position(|r| r.id == rid) {
                        batch[p2].num_new_tokens = num_new;
                        ctx.computed_tokens.insert(rid, start + num_new);
                    }
                } else if let Some(p2) = batch.iter().position(|r| r.id == rid) {
                    batch[p2].num_new_tokens = 0;
                }
            } else if !batch[pos].is_complete() && !batch[pos].output_tokens.is_empty() {
                let start = batch[pos].progress_index;
                let end = start + 1;
                let (ok, preempted_any, _hits) = allocate_growing(&mut batch, rid, ctx, &mut preempted, start, end);
                preemption_happened |= preempted_any;
                budget = budget.saturating_sub(1);
                if let Some(p2) = batch.iter().position(|r| r.id == rid) {
                    batch[p2].num_new_tokens = if ok { 1 } else { 0 };
                    if ok {
                        ctx.computed_tokens.insert(rid, start + 1);
                    }
                }
            } else {
                batch[pos].num_new_tokens = 0;
            }
        }

        // Phase 2: dequeue fresh requests, front to back, stopping on the
        // first one that can't be fit (FCFS preservation) or the moment
        // Phase 1 (or this phase) has already preempted once this step.
        while batch.len() < ctx.max_running_reqs
            && !ctx.wait_queue.is_empty()
            && budget > 0
            && !preemption_happened
        {
            let candidate = ctx.wait_queue[0].clone();
            let prefill_len = candidate.input_tokens.len();
            let num_new = clamped_chunk(prefill_len, ctx.long_prefill_token_threshold, budget);
            if num_new == 0 {
                break;
            }
            let cached = ctx.kv.get_cached_blocks(&candidate.input_tokens);
            let (ok, preempted_any, hits) = allocate_new(&mut batch, ctx, &mut preempted, &candidate, 0, num_new, &cached);
            preemption_happened |= preempted_any;
            if !ok {
                break;
            }
            cache_hits += hits;
            blocks_requested += div_ceil(num_new, ctx.kv.block_size());

            ctx.wait_queue.remove(0);
            let mut scheduled = candidate;
            scheduled.state = RequestState::Running;
            scheduled.scheduled_step_idx = Some(ctx.step_idx);
            scheduled.num_new_tokens = num_new;
            ctx.computed_tokens.insert(scheduled.id, num_new);
            budget = budget.saturating_sub(num_new as u64);
            newly_scheduled.push(ScheduledRecord {
                request: scheduled.clone(),
                delay: ctx.scheduling_processing_time,
            });
            batch.push(scheduled);
        }

        BatchResult {
            running_batch: batch,
            newly_scheduled,
            preempted,
            preemption_happened,
            remaining_budget: budget,
            cache_hits,
            blocks_requested,
        }
    }
}
