//! Analytical roofline latency model: estimates step time from a dense
//! transformer's FLOPs/bytes against the target hardware's peak throughput,
//! instead of fitting a regression against traces.

use serde::{Deserialize, Serialize};

use super::{clamp_nonneg, split_batch_tokens, LatencyModel};
use crate::request::Request;

/// Architecture shape. FLOPs/bytes are both estimated from a standard dense
/// transformer parameter count (`12 * num_layers * hidden_size^2`), which is
/// accurate to within the usual roofline-model margin of error — this is a
/// capacity-planning estimate, not a flop-exact accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dtype_bytes: usize,
}

impl ModelConfig {
    fn total_params(&self) -> f64 {
        12.0 * self.num_layers as f64 * (self.hidden_size as f64).powi(2)
    }

    fn weight_bytes(&self) -> f64 {
        self.total_params() * self.dtype_bytes as f64
    }
}

/// Target hardware characteristics for one tensor-parallel shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwConfig {
    pub peak_flops: f64,
    /// Model FLOPs utilization, in `(0, 1]`.
    pub mfu: f64,
    pub memory_bandwidth_bytes_per_sec: f64,
    /// Memory-bandwidth efficiency, in `(0, 1]`.
    pub memory_efficiency: f64,
    pub all_reduce_latency_us: f64,
    /// Fixed per-step overhead folded into `StepTime` (e.g. kernel launch
    /// and Python-side dispatch cost not captured by the roofline terms).
    pub overhead_us: f64,
}

/// `time = max(FLOPs/peakFLOPs/MFU, bytes/bandwidth/eta) +
/// allReduceLatency*(TP-1)`, computed once for the prefill contribution and
/// once for decode, then summed plus the fixed per-step overhead.
/// Queueing/output overheads reuse the blackbox alpha formulas.
#[derive(Debug, Clone)]
pub struct RooflineModel {
    model: ModelConfig,
    hw: HwConfig,
    tensor_parallel: usize,
    alpha: [f64; 3],
}

impl RooflineModel {
    pub fn new(model: ModelConfig, hw: HwConfig, tensor_parallel: usize, alpha: [f64; 3]) -> Self {
        Self {
            model,
            hw,
            tensor_parallel,
            alpha,
        }
    }

    fn all_reduce_overhead(&self) -> f64 {
        self.hw.all_reduce_latency_us * (self.tensor_parallel.saturating_sub(1) as f64)
    }

    /// `flops` total for `num_tokens`, `mem_bytes` total bytes moved —
    /// prefill amortizes one weight read across the whole chunk; decode's
    /// tiny batch re-reads weights per token.
    fn phase_time_us(&self, num_tokens: f64, mem_bytes: f64) -> f64 {
        if num_tokens <= 0.0 {
            return 0.0;
        }
        let flops = 2.0 * self.model.total_params() * num_tokens;
        let compute_s = flops / (self.hw.peak_flops * self.hw.mfu);
        let mem_s = mem_bytes / (self.hw.memory_bandwidth_bytes_per_sec * self.hw.memory_efficiency);
        compute_s.max(mem_s) * 1e6 + self.all_reduce_overhead()
    }
}

impl LatencyModel for RooflineModel {
    fn step_time(&self, batch: &[Request]) -> u64 {
        let (cache_miss, decode) = split_batch_tokens(batch);
        let weight_bytes = self.model.weight_bytes();
        let prefill = self.phase_time_us(cache_miss as f64, weight_bytes);
        let decode_t = self.phase_time_us(decode as f64, weight_bytes * decode as f64);
        clamp_nonneg(prefill + decode_t + self.hw.overhead_us)
    }

    fn queueing_time(&self, req: &Request) -> u64 {
        let t = self.alpha[0] + self.alpha[1] * req.input_tokens.len() as f64;
        clamp_nonneg(t)
    }

    fn output_token_processing_time(&self) -> u64 {
        clamp_nonneg(self.alpha[2])
    }

    fn scheduling_processing_time(&self) -> u64 {
        0
    }

    fn preemption_processing_time(&self) -> u64 {
        0
    }
}
