//! The latency-model contract and its two implementations.
//!
//! Grounded on the teacher's `transfer::dma_scheduler` cost-model shape
//! (fixed base cost + throughput-scaled term); generalized here to the
//! spec's five-operation interface and two swappable implementations.

pub mod blackbox;
pub mod roofline;

use crate::request::Request;

pub use blackbox::BlackboxModel;
pub use roofline::RooflineModel;

/// All operations return non-negative integer microseconds.
pub trait LatencyModel {
    /// Forward-pass duration for one step given the running batch.
    /// Precondition: `num_new_tokens` is set on every member by batch
    /// formation before this is called.
    fn step_time(&self, batch: &[Request]) -> u64;
    /// Arrival-to-queue delay for a single request.
    fn queueing_time(&self, req: &Request) -> u64;
    /// Per-output-token post-processing; inflates TTFT/ITL but never delays
    /// the next step.
    fn output_token_processing_time(&self) -> u64;
    /// Per-newly-scheduled overhead.
    fn scheduling_processing_time(&self) -> u64;
    /// Per-eviction overhead.
    fn preemption_processing_time(&self) -> u64;
}

/// Splits a running batch's `num_new_tokens` into cache-miss (still in
/// prefill) and decode (already past prefill, with outputs pending) totals.
/// Shared by both implementations since the split rule is the same.
pub(crate) fn split_batch_tokens(batch: &[Request]) -> (u64, u64) {
    let mut cache_miss = 0u64;
    let mut decode = 0u64;
    for r in batch {
        if r.progress_index < r.input_tokens.len() {
            cache_miss += r.num_new_tokens as u64;
        } else if !r.output_tokens.is_empty() {
            decode += r.num_new_tokens as u64;
        }
    }
    (cache_miss, decode)
}

pub(crate) fn clamp_nonneg(x: f64) -> u64 {
    if x.is_sign_negative() || x.is_nan() {
        0
    } else {
        x.round() as u64
    }
}
