//! The simulator's core guarantee: same config + same seed produces a
//! byte-identical summary, run to run, process to process.

use blis::admission::AdmissionKind;
use blis::config::{AdmissionConfig, BatchConfig, ClusterConfig, Config, KvConfig, LatencyConfig, RoutingConfig};
use blis::priority::PriorityKind;
use blis::routing::RoutingKind;
use blis::scheduler::SchedulerKind;
use blis::workload::{self, WorkloadSpec};
use blis::Simulation;

fn config() -> Config {
    Config {
        kv: KvConfig { total_kv_blocks: 256, block_size_tokens: 16, cpu_tier: None },
        batch: BatchConfig { max_running_reqs: 16, max_scheduled_tokens: 2048, long_prefill_token_threshold: 256 },
        latency: LatencyConfig::Blackbox { beta_coeffs: [2000.0, 0.35, 0.02], alpha_coeffs: [500.0, 0.05, 8000.0] },
        scheduler: SchedulerKind::Fcfs,
        priority: PriorityKind::Constant,
        admission: AdmissionConfig { policy: AdmissionKind::AlwaysAdmit, token_bucket_capacity: 0.0, token_bucket_refill_rate: 0.0 },
        routing: RoutingConfig { policy: RoutingKind::LeastLoaded, scorers: vec![], prefix_cache_capacity_per_instance: 1024 },
        cluster: ClusterConfig { num_instances: 2, admission_latency: 10, routing_latency: 5, snapshot_refresh_interval: 0 },
        horizon: 2_000_000,
        seed: 7,
        rate: 30.0,
    }
}

fn run_once(config: &Config) -> blis::ClusterSummary {
    let trace = workload::generate(&WorkloadSpec {
        seed: config.seed,
        rate: config.rate,
        horizon: blis::Tick(config.horizon),
        ..Default::default()
    });
    let mut sim = Simulation::new(config);
    for req in trace {
        sim.inject(req);
    }
    sim.run()
}

#[test]
fn identical_config_and_seed_reproduce_the_same_summary() {
    let config = config();
    let first = run_once(&config);
    let second = run_once(&config);

    assert_eq!(first.completed_requests, second.completed_requests);
    assert_eq!(first.injected_requests, second.injected_requests);
    assert_eq!(first.rejected_requests, second.rejected_requests);
    assert_eq!(first.dropped_unservable, second.dropped_unservable);
    assert_eq!(first.preemption_count, second.preemption_count);
    assert_eq!(first.still_queued, second.still_queued);
    assert_eq!(first.still_running, second.still_running);
    assert_eq!(first.ttft_mean_ms.to_bits(), second.ttft_mean_ms.to_bits());
    assert_eq!(first.e2e_p99_ms.to_bits(), second.e2e_p99_ms.to_bits());
    assert_eq!(first.cache_hit_rate.to_bits(), second.cache_hit_rate.to_bits());
    assert_eq!(first.per_class.len(), second.per_class.len());
    for (class, metrics) in &first.per_class {
        let other = second.per_class.get(class).expect("same classes present in both runs");
        assert_eq!(metrics.count, other.count);
        assert_eq!(metrics.ttft_mean_ms.to_bits(), other.ttft_mean_ms.to_bits());
    }
}

#[test]
fn different_seeds_drive_the_simulation_through_different_arrival_traces() {
    let mut a = config();
    a.seed = 7;
    let mut b = config();
    b.seed = 99;

    let trace_a: Vec<_> = workload::generate(&WorkloadSpec { seed: a.seed, rate: a.rate, horizon: blis::Tick(a.horizon), ..Default::default() })
        .into_iter()
        .map(|r| r.arrival_time)
        .collect();
    let trace_b: Vec<_> = workload::generate(&WorkloadSpec { seed: b.seed, rate: b.rate, horizon: blis::Tick(b.horizon), ..Default::default() })
        .into_iter()
        .map(|r| r.arrival_time)
        .collect();

    assert_ne!(trace_a, trace_b);
}
