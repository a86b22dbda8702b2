//! Request- and cluster-level metrics accumulation.
//!
//! Grounded on the teacher's `telemetry::stats` running-aggregate style
//! (accumulate as events happen, finalize once at the end) — generalized
//! from transfer-byte counters to request latency distributions.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::clock::Tick;
use crate::request::{RequestId, SloClass};

/// Per-request latency record. Times are stored in ticks (microseconds);
/// conversion to milliseconds happens only at summary time.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub id: RequestId,
    pub arrival_time: Tick,
    pub slo_class: SloClass,
    pub ttft_us: Option<u64>,
    pub e2e_us: Option<u64>,
    pub itls_us: Vec<u64>,
    /// Emitted in ticks (μs), not ms — see the outbound-metrics unit
    /// asymmetry this crate preserves for output compatibility.
    pub scheduling_delay_ticks: Vec<u64>,
}

impl RequestMetrics {
    fn new(id: RequestId, arrival_time: Tick, slo_class: SloClass) -> Self {
        Self {
            id,
            arrival_time,
            slo_class,
            ttft_us: None,
            e2e_us: None,
            itls_us: Vec::new(),
            scheduling_delay_ticks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassMetrics {
    pub count: usize,
    pub ttft_mean_ms: f64,
    pub ttft_p90_ms: f64,
    pub ttft_p99_ms: f64,
    pub e2e_mean_ms: f64,
    pub e2e_p99_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterSummary {
    pub ttft_mean_ms: f64,
    pub ttft_p90_ms: f64,
    pub ttft_p99_ms: f64,
    pub e2e_mean_ms: f64,
    pub e2e_p99_ms: f64,
    pub itl_mean_ms: f64,
    pub scheduling_delay_p99_ms: f64,
    pub responses_per_sec: f64,
    pub completed_requests: usize,
    pub injected_requests: usize,
    pub rejected_requests: usize,
    pub dropped_unservable: usize,
    pub preemption_count: usize,
    pub cache_hit_rate: f64,
    pub kv_thrashing_rate: f64,
    pub priority_inversions: usize,
    pub hol_blocking_events: usize,
    pub per_class: BTreeMap<SloClass, ClassMetrics>,
    pub still_queued: usize,
    pub still_running: usize,
}

/// Accumulates per-request and aggregate counters over the run. Owned by
/// the [`crate::cluster::ClusterCoordinator`] (or a single
/// [`crate::instance::SingleInstanceEngine`] in standalone mode).
#[derive(Debug, Default)]
pub struct ClusterMetrics {
    requests: BTreeMap<RequestId, RequestMetrics>,
    injected: usize,
    rejected: usize,
    dropped_unservable: usize,
    preemption_count: usize,
    cache_hits: u64,
    cache_lookups: u64,
    priority_inversions: usize,
    hol_blocking_events: usize,
}

impl ClusterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_request(&mut self, id: RequestId, arrival_time: Tick, slo_class: SloClass) {
        self.injected += 1;
        self.requests.insert(id, RequestMetrics::new(id, arrival_time, slo_class));
    }

    /// Removes a request's metric entry without counting it as completed —
    /// used for the two non-completion exits from the pipeline.
    pub fn forget_request(&mut self, id: RequestId) {
        self.requests.remove(&id);
    }

    pub fn record_rejection(&mut self) {
        self.rejected += 1;
    }

    pub fn record_dropped_unservable(&mut self, id: RequestId) {
        self.dropped_unservable += 1;
        self.requests.remove(&id);
    }

    pub fn record_ttft(&mut self, id: RequestId, ttft_us: u64) {
        if let Some(r) = self.requests.get_mut(&id) {
            r.ttft_us = Some(ttft_us);
        }
    }

    pub fn record_itl(&mut self, id: RequestId, itl_us: u64) {
        if let Some(r) = self.requests.get_mut(&id) {
            r.itls_us.push(itl_us);
        }
    }

    pub fn record_scheduling_delay(&mut self, id: RequestId, delay_ticks: u64) {
        if let Some(r) = self.requests.get_mut(&id) {
            r.scheduling_delay_ticks.push(delay_ticks);
        }
    }

    pub fn record_e2e(&mut self, id: RequestId, e2e_us: u64) {
        if let Some(r) = self.requests.get_mut(&id) {
            r.e2e_us = Some(e2e_us);
        }
    }

    pub fn record_preemption(&mut self) {
        self.preemption_count += 1;
    }

    pub fn record_cache_lookup(&mut self, hits: usize, total_blocks: usize) {
        self.cache_hits += hits as u64;
        self.cache_lookups += total_blocks as u64;
    }

    pub fn record_priority_inversion(&mut self) {
        self.priority_inversions += 1;
    }

    pub fn record_hol_blocking(&mut self) {
        self.hol_blocking_events += 1;
    }

    pub fn completed_requests(&self) -> impl Iterator<Item = &RequestMetrics> {
        self.requests.values().filter(|r| r.e2e_us.is_some())
    }

    /// INV-1: `num_requests == completed + still_queued + still_running +
    /// dropped_unservable + rejected`.
    pub fn conservation_ok(&self, still_queued: usize, still_running: usize) -> bool {
        let completed = self.completed_requests().count();
        self.injected == completed + still_queued + still_running + self.dropped_unservable + self.rejected
    }

    pub fn finalize(&self, horizon: Tick, still_queued: usize, still_running: usize) -> ClusterSummary {
        let completed: Vec<&RequestMetrics> = self.completed_requests().collect();
        let completed_count = completed.len();

        let ttfts_ms: Vec<f64> = completed.iter().filter_map(|r| r.ttft_us).map(us_to_ms).collect();
        let e2es_ms: Vec<f64> = completed.iter().filter_map(|r| r.e2e_us).map(us_to_ms).collect();
        let all_itls_ms: Vec<f64> = completed.iter().flat_map(|r| r.itls_us.iter().copied()).map(us_to_ms).collect();
        let all_delays_ms: Vec<f64> = self
            .requests
            .values()
            .flat_map(|r| r.scheduling_delay_ticks.iter().copied())
            .map(us_to_ms)
            .collect();

        let mut per_class: BTreeMap<SloClass, ClassMetrics> = BTreeMap::new();
        for class in SloClass::ALL {
            let class_ttfts: Vec<f64> = completed
                .iter()
                .filter(|r| r.slo_class == class)
                .filter_map(|r| r.ttft_us)
                .map(us_to_ms)
                .collect();
            let class_e2es: Vec<f64> = completed
                .iter()
                .filter(|r| r.slo_class == class)
                .filter_map(|r| r.e2e_us)
                .map(us_to_ms)
                .collect();
            if class_ttfts.is_empty() && class_e2es.is_empty() {
                continue;
            }
            per_class.insert(
                class,
                ClassMetrics {
                    count: class_e2es.len(),
                    ttft_mean_ms: mean(&class_ttfts),
                    ttft_p90_ms: percentile(&class_ttfts, 0.90),
                    ttft_p99_ms: percentile(&class_ttfts, 0.99),
                    e2e_mean_ms: mean(&class_e2es),
                    e2e_p99_ms: percentile(&class_e2es, 0.99),
                },
            );
        }

        let responses_per_sec = if horizon.as_micros() > 0 {
            completed_count as f64 / (horizon.as_micros() as f64 / 1_000_000.0)
        } else {
            0.0
        };
        let cache_hit_rate = if self.cache_lookups > 0 {
            self.cache_hits as f64 / self.cache_lookups as f64
        } else {
            0.0
        };
        let kv_thrashing_rate = if completed_count > 0 {
            self.preemption_count as f64 / completed_count as f64
        } else {
            0.0
        };

        ClusterSummary {
            ttft_mean_ms: mean(&ttfts_ms),
            ttft_p90_ms: percentile(&ttfts_ms, 0.90),
            ttft_p99_ms: percentile(&ttfts_ms, 0.99),
            e2e_mean_ms: mean(&e2es_ms),
            e2e_p99_ms: percentile(&e2es_ms, 0.99),
            itl_mean_ms: mean(&all_itls_ms),
            scheduling_delay_p99_ms: percentile(&all_delays_ms, 0.99),
            responses_per_sec,
            completed_requests: completed_count,
            injected_requests: self.injected,
            rejected_requests: self.rejected,
            dropped_unservable: self.dropped_unservable,
            preemption_count: self.preemption_count,
            cache_hit_rate,
            kv_thrashing_rate,
            priority_inversions: self.priority_inversions,
            hol_blocking_events: self.hol_blocking_events,
            per_class,
            still_queued,
            still_running,
        }
    }
}

fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1_000.0
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

/// Nearest-rank percentile over a sorted copy of `xs`. `p` in `[0,1]`.
fn percentile(xs: &[f64], p: f64) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let rank = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len()) - 1;
    sorted[rank]
}

/// Standard Jain's fairness index over a set of per-entity values:
/// `(Σx)² / (n · Σx²)`. Defined as `1.0` for an all-zero input (perfectly
/// fair — nobody got anything, nobody got more than anybody else).
pub fn jain_fairness_index(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    let sum: f64 = values.iter().sum();
    let sum_sq: f64 = values.iter().map(|x| x * x).sum();
    if sum_sq == 0.0 {
        return 1.0;
    }
    (sum * sum) / (values.len() as f64 * sum_sq)
}
