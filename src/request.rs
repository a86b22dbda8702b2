//! The request data model: immutable identity fields set by the workload
//! generator, plus mutable lifecycle fields mutated by the engine as the
//! request moves through admission, routing, the wait queue, and batch
//! execution.

use serde::{Deserialize, Serialize};

use crate::clock::Tick;

/// Unique request identifier, assigned by the workload generator.
pub type RequestId = u64;

/// Opaque tenant identifier for multi-tenant fairness accounting.
pub type TenantId = u32;

/// Index of an instance within the cluster (`0..num_instances`).
pub type InstanceId = usize;

/// A single LLM-inference token identifier. The simulator never interprets
/// token content — only token *counts* and hash chains over them matter.
pub type TokenId = u32;

/// Per-request latency-tier tag, used for per-class metrics and optionally
/// folded into priority computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SloClass {
    Critical,
    Standard,
    Sheddable,
    Batch,
    Background,
}

impl SloClass {
    pub const ALL: [SloClass; 5] = [
        SloClass::Critical,
        SloClass::Standard,
        SloClass::Sheddable,
        SloClass::Batch,
        SloClass::Background,
    ];

    pub fn parse(name: &str) -> Option<SloClass> {
        Some(match name {
            "critical" => SloClass::Critical,
            "standard" => SloClass::Standard,
            "sheddable" => SloClass::Sheddable,
            "batch" => SloClass::Batch,
            "background" => SloClass::Background,
            _ => return None,
        })
    }
}

impl std::fmt::Display for SloClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SloClass::Critical => "critical",
            SloClass::Standard => "standard",
            SloClass::Sheddable => "sheddable",
            SloClass::Batch => "batch",
            SloClass::Background => "background",
        };
        write!(f, "{s}")
    }
}

/// A request's affinity hint, used by prefix-aware routing scorers to group
/// requests that are likely to share a cached prompt prefix (e.g. the same
/// chat session or system prompt).
pub type PrefixGroup = u64;

/// A request's position in its lifecycle. A small enum (not a free-form
/// string) so an invalid transition is a compile-time impossible state
/// rather than a typo waiting to happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestState {
    Queued,
    Running,
    Completed,
}

/// A single inference request flowing through the simulator.
///
/// Identity fields (`id`, `arrival_time`, `input_tokens`, `output_tokens`,
/// `slo_class`, `tenant_id`, `prefix_group`) are set once by the workload
/// generator and never mutated by the core. Lifecycle fields are owned and
/// mutated by the engine as the request advances.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub arrival_time: Tick,
    pub input_tokens: Vec<TokenId>,
    /// Pre-sampled output tokens. Length drives the number of decode steps;
    /// the simulator never actually samples — real outputs are supplied by
    /// the (out-of-scope) workload generator so that latency, not text
    /// quality, is what's under test.
    pub output_tokens: Vec<TokenId>,
    pub slo_class: SloClass,
    pub tenant_id: TenantId,
    pub prefix_group: PrefixGroup,

    pub state: RequestState,
    /// Tokens already processed (prefill complete iff `progress_index >=
    /// input_tokens.len()`).
    pub progress_index: usize,
    /// Set per step by batch formation; read by the latency model.
    pub num_new_tokens: usize,
    pub assigned_instance: Option<InstanceId>,
    pub scheduled_step_idx: Option<u64>,
    /// Set each step by the priority policy.
    pub priority: f64,
}

impl Request {
    pub fn new(
        id: RequestId,
        arrival_time: Tick,
        input_tokens: Vec<TokenId>,
        output_tokens: Vec<TokenId>,
        slo_class: SloClass,
        tenant_id: TenantId,
        prefix_group: PrefixGroup,
    ) -> Self {
        Self {
            id,
            arrival_time,
            input_tokens,
            output_tokens,
            slo_class,
            tenant_id,
            prefix_group,
            state: RequestState::Queued,
            progress_index: 0,
            num_new_tokens: 0,
            assigned_instance: None,
            scheduled_step_idx: None,
            priority: 0.0,
        }
    }

    pub fn prefill_complete(&self) -> bool {
        self.progress_index >= self.input_tokens.len()
    }

    pub fn num_output_tokens(&self) -> usize {
        self.output_tokens.len()
    }

    /// A request is complete once it has processed its full prompt plus at
    /// least `max(1, len(output_tokens))` decode steps, minus one: a
    /// zero-output request completes in the same step its prefill finishes.
    pub fn is_complete(&self) -> bool {
        let total_needed = self.input_tokens.len()
            + std::cmp::max(1, self.num_output_tokens())
            - 1;
        self.progress_index >= total_needed
    }

    pub fn blocks_needed(&self, block_size: usize) -> usize {
        div_ceil(self.input_tokens.len(), block_size)
    }
}

pub fn div_ceil(n: usize, d: usize) -> usize {
    if d == 0 {
        return 0;
    }
    (n + d - 1) / d
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(input: usize, output: usize) -> Request {
        Request::new(
            1,
            Tick(0),
            vec![0; input],
            vec![0; output],
            SloClass::Standard,
            0,
            0,
        )
    }

    #[test]
    fn zero_output_completes_when_prefill_completes() {
        let mut r = req(10, 0);
        r.progress_index = 9;
        assert!(!r.is_complete());
        r.progress_index = 10;
        assert!(r.is_complete());
        assert!(r.prefill_complete());
    }

    #[test]
    fn multi_output_needs_decode_steps() {
        let mut r = req(10, 3);
        r.progress_index = 10;
        assert!(!r.is_complete());
        r.progress_index = 12;
        assert!(!r.is_complete());
        r.progress_index = 13;
        assert!(r.is_complete());
    }

    #[test]
    fn blocks_needed_rounds_up() {
        let r = req(17, 1);
        assert_eq!(r.blocks_needed(16), 2);
        let r2 = req(16, 1);
        assert_eq!(r2.blocks_needed(16), 1);
    }

    #[test]
    fn slo_class_round_trips_by_name() {
        for c in SloClass::ALL {
            assert_eq!(SloClass::parse(&c.to_string()), Some(c));
        }
        assert_eq!(SloClass::parse("bogus"), None);
    }
}
