//! Routing: picks which instance a newly admitted request is dispatched to.
//!
//! Grounded on the teacher's `cache::pager::SharedPager` style of holding
//! one canonical state snapshot type consumed by multiple strategies —
//! generalized here from "which tier" to "which instance".

pub mod prefix_cache;
pub mod scorer;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::clock::Tick;
use crate::request::{InstanceId, Request};
use prefix_cache::PrefixCacheIndex;
use scorer::Scorer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingKind {
    RoundRobin,
    LeastLoaded,
    Weighted,
    PrefixAffinity,
    AlwaysBusiest,
}

/// One canonical per-instance observation tuple, passed by value to scorers
/// and routing policies. `pending_requests` is router-local (always fresh);
/// the rest are instance-reported and may be a periodic snapshot (see
/// [`crate::cluster::ClusterCoordinator`]).
#[derive(Debug, Clone, Copy)]
pub struct RoutingSnapshot {
    pub instance_id: InstanceId,
    pub queue_depth: usize,
    pub batch_size: usize,
    pub pending_requests: usize,
    pub kv_utilization: f64,
    pub free_kv_blocks: usize,
    pub cache_hit_rate: f64,
}

impl RoutingSnapshot {
    pub fn effective_load(&self) -> f64 {
        (self.queue_depth + self.batch_size + self.pending_requests) as f64
    }
}

pub trait RoutingPolicy {
    fn route(&mut self, req: &Request, snapshots: &[RoutingSnapshot], clock: Tick) -> InstanceId;
}

/// Cyclic assignment, independent of load.
pub struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self { next: 0 }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for RoundRobin {
    fn route(&mut self, _req: &Request, snapshots: &[RoutingSnapshot], _clock: Tick) -> InstanceId {
        let target = snapshots[self.next % snapshots.len()].instance_id;
        self.next = (self.next + 1) % snapshots.len().max(1);
        target
    }
}

fn argmin_load(snapshots: &[RoutingSnapshot]) -> InstanceId {
    snapshots
        .iter()
        .min_by(|a, b| {
            a.effective_load()
                .partial_cmp(&b.effective_load())
                .unwrap()
                .then(a.instance_id.cmp(&b.instance_id))
        })
        .expect("snapshots must be non-empty")
        .instance_id
}

fn argmax_load(snapshots: &[RoutingSnapshot]) -> InstanceId {
    let mut best = snapshots[0];
    for s in &snapshots[1..] {
        if s.effective_load() > best.effective_load()
            || (s.effective_load() == best.effective_load() && s.instance_id < best.instance_id)
        {
            best = *s;
        }
    }
    best.instance_id
}

pub struct LeastLoaded;

impl RoutingPolicy for LeastLoaded {
    fn route(&mut self, _req: &Request, snapshots: &[RoutingSnapshot], _clock: Tick) -> InstanceId {
        argmin_load(snapshots)
    }
}

/// Pathological: routes to the busiest instance. Kept for adversarial
/// workload scenarios, not recommended for production-like configs.
pub struct AlwaysBusiest;

impl RoutingPolicy for AlwaysBusiest {
    fn route(&mut self, _req: &Request, snapshots: &[RoutingSnapshot], _clock: Tick) -> InstanceId {
        argmax_load(snapshots)
    }
}

/// Standalone prefix-matching router: less capable than `Weighted` composed
/// with the prefix-affinity scorer because it ignores load entirely,
/// picking purely by raw (unnormalized) matched-block count.
pub struct PrefixAffinityRouting {
    index: PrefixCacheIndex,
}

impl PrefixAffinityRouting {
    pub fn new(num_instances: usize, capacity_per_instance: usize, block_size: usize) -> Self {
        Self {
            index: PrefixCacheIndex::new(num_instances, capacity_per_instance, block_size),
        }
    }
}

impl RoutingPolicy for PrefixAffinityRouting {
    fn route(&mut self, req: &Request, snapshots: &[RoutingSnapshot], clock: Tick) -> InstanceId {
        let hashes = self.index.compute_block_hashes(&req.input_tokens);
        let matches: Vec<(InstanceId, usize)> = snapshots
            .iter()
            .map(|s| (s.instance_id, self.index.lookup(&hashes, s.instance_id, clock)))
            .collect();
        let mut target = matches[0];
        for &(id, count) in &matches[1..] {
            if count > target.1 || (count == target.1 && id < target.0) {
                target = (id, count);
            }
        }
        let target = target.0;
        self.index.record(&hashes, target, clock);
        target
    }
}

/// Composes weighted scorers. Weights are relative: `[3,2,2]` and
/// `[0.43,0.29,0.29]` must route identically (INV-6), so weights are
/// normalized to sum to 1 on every call rather than once at construction,
/// which would otherwise matter only for floating-point edge cases.
pub struct Weighted {
    scorers: Vec<(f64, Box<dyn Scorer + Send + Sync>)>,
}

impl Weighted {
    pub fn new(scorers: Vec<(f64, Box<dyn Scorer + Send + Sync>)>) -> Self {
        Self { scorers }
    }
}

impl RoutingPolicy for Weighted {
    fn route(&mut self, req: &Request, snapshots: &[RoutingSnapshot], clock: Tick) -> InstanceId {
        let total_weight: f64 = self.scorers.iter().map(|(w, _)| w).sum();
        let mut aggregate: BTreeMap<InstanceId, f64> = snapshots.iter().map(|s| (s.instance_id, 0.0)).collect();

        for (weight, scorer) in &self.scorers {
            let normalized = weight / total_weight;
            let scores = scorer.score(req, snapshots);
            for (id, score) in &aggregate.clone() {
                let raw = scores.get(id).copied().unwrap_or(0.0).clamp(0.0, 1.0);
                *aggregate.get_mut(id).unwrap() = score + normalized * raw;
            }
        }

        let mut target = None;
        for (&id, &score) in &aggregate {
            target = match target {
                None => Some((id, score)),
                Some((_, best_score)) if score > best_score => Some((id, score)),
                Some(best) => Some(best),
            };
        }
        let target = target.expect("snapshots must be non-empty").0;

        for (_, scorer) in &mut self.scorers {
            scorer.on_route(req, target, clock);
        }

        target
    }
}
