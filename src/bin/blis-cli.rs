//! Thin CLI: load a config, generate a seeded workload, run the simulation,
//! and emit the resulting metrics as JSON.
//!
//! Grounded on the teacher's `bin/server` binary shape: parse args, init
//! tracing, load+validate config, run, report — no business logic lives
//! here that the library doesn't already own.

use std::path::PathBuf;

use blis::config::{AdmissionConfig, BatchConfig, ClusterConfig, Config, KvConfig, LatencyConfig, RoutingConfig};
use blis::{Config as BlisConfig, Simulation};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "blis-cli", about = "Deterministic discrete-event simulator for LLM inference clusters")]
struct Args {
    /// Path to a JSON config file. Falls back to a small built-in demo
    /// config when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `config.seed`.
    #[arg(long)]
    seed: Option<u64>,

    /// Overrides `config.rate` (requests/sec).
    #[arg(long)]
    rate: Option<f64>,

    /// Overrides `config.horizon` (simulated microseconds).
    #[arg(long)]
    horizon: Option<u64>,

    /// Write the JSON summary here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn demo_config() -> BlisConfig {
    Config {
        kv: KvConfig {
            total_kv_blocks: 2048,
            block_size_tokens: 16,
            cpu_tier: None,
        },
        batch: BatchConfig {
            max_running_reqs: 64,
            max_scheduled_tokens: 8192,
            long_prefill_token_threshold: 512,
        },
        latency: LatencyConfig::Blackbox {
            beta_coeffs: [2000.0, 0.35, 0.02],
            alpha_coeffs: [500.0, 0.05, 8000.0],
        },
        scheduler: blis::scheduler::SchedulerKind::Fcfs,
        priority: blis::priority::PriorityKind::Constant,
        admission: AdmissionConfig {
            policy: blis::admission::AdmissionKind::AlwaysAdmit,
            token_bucket_capacity: 0.0,
            token_bucket_refill_rate: 0.0,
        },
        routing: RoutingConfig {
            policy: blis::routing::RoutingKind::LeastLoaded,
            scorers: vec![],
            prefix_cache_capacity_per_instance: 4096,
        },
        cluster: ClusterConfig {
            num_instances: 4,
            admission_latency: 50,
            routing_latency: 20,
            snapshot_refresh_interval: 0,
        },
        horizon: 60_000_000,
        seed: 0,
        rate: 50.0,
    }
}

fn load_config(args: &Args) -> anyhow::Result<BlisConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)?
        }
        None => demo_config(),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(rate) = args.rate {
        config.rate = rate;
    }
    if let Some(horizon) = args.horizon {
        config.horizon = horizon;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let workload = blis::workload::generate(&blis::workload::WorkloadSpec {
        seed: config.seed,
        rate: config.rate,
        horizon: blis::Tick(config.horizon),
        ..Default::default()
    });
    tracing::info!(requests = workload.len(), "generated workload");

    let mut sim = Simulation::new(&config);
    for req in workload {
        sim.inject(req);
    }
    let summary = sim.run();

    if summary.still_queued > 0 || summary.still_running > 0 {
        tracing::warn!(
            still_queued = summary.still_queued,
            still_running = summary.still_running,
            "horizon reached before the workload fully drained"
        );
    }

    let json = serde_json::to_string_pretty(&summary)?;
    match &args.output {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{json}"),
    }
    Ok(())
}
