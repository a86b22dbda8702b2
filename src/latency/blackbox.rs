//! Linear-regression latency model fit offline against real engine traces.

use super::{clamp_nonneg, split_batch_tokens, LatencyModel};
use crate::request::Request;

/// `StepTime = beta[0] + beta[1]*cacheMissTokens + beta[2]*decodeTokens`.
/// `QueueingTime = alpha[0] + alpha[1]*len(InputTokens)`,
/// `OutputTokenProcessingTime = alpha[2]`.
#[derive(Debug, Clone)]
pub struct BlackboxModel {
    beta: [f64; 3],
    alpha: [f64; 3],
}

impl BlackboxModel {
    /// Coefficients must already be validated finite by
    /// [`crate::config::Config::validate`]; this constructor trusts that.
    pub fn new(beta: [f64; 3], alpha: [f64; 3]) -> Self {
        Self { beta, alpha }
    }
}

impl LatencyModel for BlackboxModel {
    fn step_time(&self, batch: &[Request]) -> u64 {
        let (cache_miss, decode) = split_batch_tokens(batch);
        let t = self.beta[0] + self.beta[1] * cache_miss as f64 + self.beta[2] * decode as f64;
        clamp_nonneg(t)
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
