//! Routing scorers: pure (or observer-stateful) functions from a request and
//! the router's per-instance snapshots to a `[0,1]` score per instance.

use std::collections::BTreeMap;

use crate::clock::Tick;
use crate::request::{InstanceId, Request};
use crate::routing::prefix_cache::PrefixCacheIndex;
use crate::routing::RoutingSnapshot;

/// `Score` must produce an entry for every instance in `snapshots`
/// (completeness, INV-2) — callers are entitled to index the result by any
/// instance id present in the snapshot slice.
pub trait Scorer {
    fn score(&self, req: &Request, snapshots: &[RoutingSnapshot]) -> BTreeMap<InstanceId, f64>;

    /// Stateful scorers observe the final routing decision here. No-op by
    /// default for pure scorers.
    fn on_route(&mut self, _req: &Request, _target: InstanceId, _clock: Tick) {}
}

pub struct QueueDepthScorer;

impl Scorer for QueueDepthScorer {
    fn score(&self, _req: &Request, snapshots: &[RoutingSnapshot]) -> BTreeMap<InstanceId, f64> {
        let loads: Vec<f64> = snapshots.iter().map(RoutingSnapshot::effective_load).collect();
        let max_load = loads.iter().cloned().fold(f64::MIN, f64::max);
        let min_load = loads.iter().cloned().fold(f64::MAX, f64::min);
        let span = max_load - min_load;
        snapshots
            .iter()
            .map(|s| {
                let score = if span <= 0.0 {
                    1.0
                } else {
                    (max_load - s.effective_load()) / span
                };
                (s.instance_id, score)
            })
            .collect()
    }
}

pub struct KvUtilizationScorer;

impl Scorer for KvUtilizationScorer {
    fn score(&self, _req: &Request, snapshots: &[RoutingSnapshot]) -> BTreeMap<InstanceId, f64> {
        snapshots
            .iter()
            .map(|s| (s.instance_id, 1.0 - s.kv_utilization))
            .collect()
    }
}

pub struct LoadBalanceScorer;

impl Scorer for LoadBalanceScorer {
    fn score(&self, _req: &Request, snapshots: &[RoutingSnapshot]) -> BTreeMap<InstanceId, f64> {
        snapshots
            .iter()
            .map(|s| (s.instance_id, 1.0 / (1.0 + s.effective_load())))
            .collect()
    }
}

/// Scores by longest-consecutive-prefix match against the router-side
/// prefix cache index. A zero-block request (empty prompt) has no prefix
/// signal to offer, so every instance scores equally.
pub struct PrefixAffinityScorer {
    index: PrefixCacheIndex,
}

impl PrefixAffinityScorer {
    pub fn new(num_instances: usize, capacity_per_instance: usize, block_size: usize) -> Self {
        Self {
            index: PrefixCacheIndex::new(num_instances, capacity_per_instance, block_size),
        }
    }
}

impl Scorer for PrefixAffinityScorer {
    fn score(&self, req: &Request, snapshots: &[RoutingSnapshot]) -> BTreeMap<InstanceId, f64> {
        let hashes = self.index.compute_block_hashes(&req.input_tokens);
        if hashes.is_empty() {
            return snapshots.iter().map(|s| (s.instance_id, 1.0)).collect();
        }
        // `PrefixCacheIndex::lookup` refreshes access ticks, but `score`
        // takes `&self` and must not mutate on a read. Use `lookup_readonly`
        // instead, which runs the same prefix-stop match without touching
        // timestamps.
        snapshots
            .iter()
            .map(|s| {
                let matched = self.lookup_readonly(&hashes, s.instance_id);
                (s.instance_id, matched as f64 / hashes.len() as f64)
            })
            .collect()
    }

    fn on_route(&mut self, req: &Request, target: InstanceId, clock: Tick) {
        let hashes = self.index.compute_block_hashes(&req.input_tokens);
        self.index.record(&hashes, target, clock);
    }
}

impl PrefixAffinityScorer {
    fn lookup_readonly(&self, hashes: &[crate::kv::block::BlockHash], instance: InstanceId) -> usize {
        // Matches PrefixCacheIndex::lookup's prefix-stop rule without the
        // access-tick refresh, since `score` takes `&self`.
        let mut count = 0;
        for h in hashes {
            if self.index.contains(*h, instance) {
                count += 1;
            } else {
                break;
            }
        }
        count
    }
}

pub fn build(name: &str, num_instances: usize, capacity_per_instance: usize, block_size: usize) -> Box<dyn Scorer + Send + Sync> {
    match name {
        "queue-depth" => Box::new(QueueDepthScorer),
        "kv-utilization" => Box::new(KvUtilizationScorer),
        "load-balance" => Box::new(LoadBalanceScorer),
        "prefix-affinity" => Box::new(PrefixAffinityScorer::new(num_instances, capacity_per_instance, block_size)),
        other => panic!("unknown scorer name {other:?} (should have been rejected by Config::validate)"),
    }
}
