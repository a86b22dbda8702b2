//! Seeded synthetic workload generation.
//!
//! Not a production traffic generator — a deterministic helper for the CLI
//! demo scenario and the end-to-end tests, so a run is fully reproducible
//! from `(seed, rate, horizon)` alone.
//!
//! Grounded on the teacher's `bench::synthetic_trace` seeded-RNG harness
//! (one `StdRng` seeded once, every draw threaded through it — never
//! `thread_rng()`, so two runs with the same seed produce the same trace).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::Tick;
use crate::request::{Request, RequestId, SloClass};

/// Shape knobs for [`generate`]. Distributions are intentionally simple
/// (uniform token counts, Poisson arrivals) — realism is the out-of-scope
/// production workload generator's job.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub seed: u64,
    /// Mean inbound request rate, requests per second.
    pub rate: f64,
    pub horizon: Tick,
    pub min_input_tokens: usize,
    pub max_input_tokens: usize,
    pub min_output_tokens: usize,
    pub max_output_tokens: usize,
    pub num_tenants: u32,
    pub num_prefix_groups: u64,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            seed: 0,
            rate: 50.0,
            horizon: Tick(10_000_000),
            min_input_tokens: 16,
            max_input_tokens: 512,
            min_output_tokens: 1,
            max_output_tokens: 128,
            num_tenants: 4,
            num_prefix_groups: 8,
        }
    }
}

/// Generates a Poisson-arrival request trace up to `spec.horizon`, sorted
/// by arrival time (the event queue doesn't require this, but it keeps
/// `RequestId` assignment monotone with arrival order, which scenario
/// assertions rely on).
pub fn generate(spec: &WorkloadSpec) -> Vec<Request> {
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let mut requests = Vec::new();
    let mut clock_us = 0u64;
    let mut next_id: RequestId = 1;

    loop {
        let interarrival_us = sample_exponential_us(&mut rng, spec.rate);
        clock_us = clock_us.saturating_add(interarrival_us);
        if clock_us > spec.horizon.as_micros() {
            break;
        }

        let input_len = rng.gen_range(spec.min_input_tokens..=spec.max_input_tokens);
        let output_len = rng.gen_range(spec.min_output_tokens..=spec.max_output_tokens);
        let slo_class = sample_slo_class(&mut rng);
        let tenant_id = rng.gen_range(0..spec.num_tenants.max(1));
        let prefix_group = rng.gen_range(0..spec.num_prefix_groups.max(1));

        let input_tokens = (0..input_len as u32).map(|t| t % 50_000).collect();
        let output_tokens = vec![0u32; output_len];

        requests.push(Request::new(
            next_id,
            Tick(clock_us),
            input_tokens,
            output_tokens,
            slo_class,
            tenant_id,
            prefix_group,
        ));
        next_id += 1;
    }

    requests
}

/// Inverse-CDF draw for an exponential interarrival time at `rate`
/// requests/sec, in microseconds. `rate <= 0` is rejected by
/// [`crate::config::Config::validate`] before this is ever called.
fn sample_exponential_us(rng: &mut StdRng, rate: f64) -> u64 {
    let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let seconds = -u.ln() / rate;
    (seconds * 1_000_000.0).round().max(0.0) as u64
}

fn sample_slo_class(rng: &mut StdRng) -> SloClass {
    match rng.gen_range(0..SloClass::ALL.len()) {
        0 => SloClass::Critical,
        1 => SloClass::Standard,
        2 => SloClass::Sheddable,
        3 => SloClass::Batch,
        _ => SloClass::Background,
    }
}
