//! Runtime configuration for the simulator.
//!
//! A single [`Config`] struct is the core's only configuration surface.
//! Parsing it from YAML/JSON on disk is an adapter concern (see spec's
//! Non-goals); this module owns only the struct shape and [`Config::validate`],
//! which fails fast with a [`ConfigError`] rather than let a malformed
//! simulation silently produce garbage metrics.

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionKind;
use crate::error::ConfigError;
use crate::priority::PriorityKind;
use crate::routing::RoutingKind;
use crate::scheduler::SchedulerKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    pub total_kv_blocks: usize,
    pub block_size_tokens: usize,
    pub cpu_tier: Option<CpuTierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuTierConfig {
    pub cpu_blocks: usize,
    /// Offload when GPU tier usage exceeds this fraction of capacity, in `(0, 1]`.
    pub offload_threshold: f64,
    /// Transfer bandwidth, in blocks per tick.
    pub transfer_bandwidth: f64,
    pub transfer_base_latency: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub max_running_reqs: usize,
    pub max_scheduled_tokens: usize,
    /// `0` disables chunked prefill.
    pub long_prefill_token_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LatencyConfig {
    Blackbox {
        beta_coeffs: [f64; 3],
        alpha_coeffs: [f64; 3],
    },
    Roofline {
        model: crate::latency::roofline::ModelConfig,
        hardware: crate::latency::roofline::HwConfig,
        tensor_parallel: usize,
        alpha_coeffs: [f64; 3],
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerWeight {
    pub name: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub policy: RoutingKind,
    pub scorers: Vec<ScorerWeight>,
    pub prefix_cache_capacity_per_instance: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub policy: AdmissionKind,
    pub token_bucket_capacity: f64,
    /// Refill rate, in tokens per second.
    pub token_bucket_refill_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub num_instances: usize,
    pub admission_latency: u64,
    pub routing_latency: u64,
    /// `0` means always re-read instance-reported fields live (Immediate).
    pub snapshot_refresh_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub kv: KvConfig,
    pub batch: BatchConfig,
    pub latency: LatencyConfig,
    pub scheduler: SchedulerKind,
    pub priority: PriorityKind,
    pub admission: AdmissionConfig,
    pub routing: RoutingConfig,
    pub cluster: ClusterConfig,
    pub horizon: u64,
    pub seed: u64,
    /// Mean inbound request rate, requests per second. Used only by the
    /// demo/test workload helpers, not by the core.
    pub rate: f64,
}

pub const VALID_ADMISSION: &[&str] = &["always-admit", "token-bucket", "reject-all"];
pub const VALID_ROUTING: &[&str] = &[
    "round-robin",
    "least-loaded",
    "weighted",
    "prefix-affinity",
    "always-busiest",
];
pub const VALID_SCORERS: &[&str] = &[
    "prefix-affinity",
    "queue-depth",
    "kv-utilization",
    "load-balance",
];
pub const VALID_SCHEDULER: &[&str] = &["fcfs", "priority-fcfs", "sjf", "reverse-priority"];
pub const VALID_PRIORITY: &[&str] = &["constant", "slo-based", "inverted-slo"];

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kv.total_kv_blocks == 0 {
            return Err(ConfigError::MustBePositive {
                field: "kv.total_kv_blocks",
                got: 0.0,
            });
        }
        if self.kv.block_size_tokens == 0 {
            return Err(ConfigError::MustBePositive {
                field: "kv.block_size_tokens",
                got: 0.0,
            });
        }
        if let Some(cpu) = &self.kv.cpu_tier {
            if !(cpu.offload_threshold > 0.0 && cpu.offload_threshold <= 1.0) {
                return Err(ConfigError::MustBePositive {
                    field: "kv.cpu_tier.offload_threshold",
                    got: cpu.offload_threshold,
                });
            }
            if cpu.transfer_bandwidth <= 0.0 {
                return Err(ConfigError::MustBePositive {
                    field: "kv.cpu_tier.transfer_bandwidth",
                    got: cpu.transfer_bandwidth,
                });
            }
        }

        if self.batch.max_running_reqs == 0 {
            return Err(ConfigError::MustBePositive {
                field: "batch.max_running_reqs",
                got: 0.0,
            });
        }
        if self.batch.max_scheduled_tokens == 0 {
            return Err(ConfigError::MustBePositive {
                field: "batch.max_scheduled_tokens",
                got: 0.0,
            });
        }

        match &self.latency {
            LatencyConfig::Blackbox {
                beta_coeffs,
                alpha_coeffs,
            } => {
                for (i, c) in beta_coeffs.iter().enumerate() {
                    check_finite("latency.beta_coeffs", i, *c)?;
                }
                for (i, c) in alpha_coeffs.iter().enumerate() {
                    check_finite("latency.alpha_coeffs", i, *c)?;
                }
            }
            LatencyConfig::Roofline {
                tensor_parallel,
                alpha_coeffs,
                model,
                hardware,
            } => {
                if *tensor_parallel == 0 {
                    return Err(ConfigError::MustBePositive {
                        field: "latency.tensor_parallel",
                        got: 0.0,
                    });
                }
                for (i, c) in alpha_coeffs.iter().enumerate() {
                    check_finite("latency.alpha_coeffs", i, *c)?;
                }
                if model.hidden_size == 0 {
                    return Err(ConfigError::MustBePositive {
                        field: "latency.model.hidden_size",
                        got: 0.0,
                    });
                }
                if model.num_layers == 0 {
                    return Err(ConfigError::MustBePositive {
                        field: "latency.model.num_layers",
                        got: 0.0,
                    });
                }
                if hardware.peak_flops <= 0.0 {
                    return Err(ConfigError::MustBePositive {
                        field: "latency.hardware.peak_flops",
                        got: hardware.peak_flops,
                    });
                }
                if !(hardware.mfu > 0.0 && hardware.mfu <= 1.0) {
                    return Err(ConfigError::MustBePositive {
                        field: "latency.hardware.mfu",
                        got: hardware.mfu,
                    });
                }
                if hardware.memory_bandwidth_bytes_per_sec <= 0.0 {
                    return Err(ConfigError::MustBePositive {
                        field: "latency.hardware.memory_bandwidth_bytes_per_sec",
                        got: hardware.memory_bandwidth_bytes_per_sec,
                    });
                }
                if !(hardware.memory_efficiency > 0.0 && hardware.memory_efficiency <= 1.0) {
                    return Err(ConfigError::MustBePositive {
                        field: "latency.hardware.memory_efficiency",
                        got: hardware.memory_efficiency,
                    });
                }
            }
        }

        if self.cluster.num_instances == 0 {
            return Err(ConfigError::MustBePositive {
                field: "cluster.num_instances",
                got: 0.0,
            });
        }
        if self.rate <= 0.0 {
            return Err(ConfigError::MustBePositive {
                field: "rate",
                got: self.rate,
            });
        }

        for s in &self.routing.scorers {
            if s.weight <= 0.0 {
                return Err(ConfigError::NonPositiveScorerWeight {
                    name: s.name.clone(),
                    weight: s.weight,
                });
            }
            if !VALID_SCORERS.contains(&s.name.as_str()) {
                return Err(ConfigError::UnknownEnumValue {
                    field: "routing.scorers[].name",
                    got: s.name.clone(),
                    valid: VALID_SCORERS,
                });
            }
        }

        Ok(())
    }
}

fn check_finite(field: &'static str, idx: usize, v: f64) -> Result<(), ConfigError> {
    if !v.is_finite() {
        return Err(ConfigError::NonFiniteCoefficient {
            field: format!("{field}[{idx}]"),
            got: v,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionKind;
    use crate::priority::PriorityKind;
    use crate::routing::RoutingKind;
    use crate::scheduler::SchedulerKind;

    fn base() -> Config {
        Config {
            kv: KvConfig {
                total_kv_blocks: 100,
                block_size_tokens: 16,
                cpu_tier: None,
            },
            batch: BatchConfig {
                max_running_reqs: 8,
                max_scheduled_tokens: 2048,
                long_prefill_token_threshold: 0,
            },
            latency: LatencyConfig::Blackbox {
                beta_coeffs: [1.0, 0.1, 0.2],
                alpha_coeffs: [1.0, 0.01, 1.0],
            },
            scheduler: SchedulerKind::Fcfs,
            priority: PriorityKind::Constant,
            admission: AdmissionConfig {
                policy: AdmissionKind::AlwaysAdmit,
                token_bucket_capacity: 0.0,
                token_bucket_refill_rate: 0.0,
            },
            routing: RoutingConfig {
                policy: RoutingKind::RoundRobin,
                scorers: vec![],
                prefix_cache_capacity_per_instance: 1024,
            },
            cluster: ClusterConfig {
                num_instances: 1,
                admission_latency: 0,
                routing_latency: 0,
                snapshot_refresh_interval: 0,
            },
            horizon: 1_000_000,
            seed: 0,
            rate: 100.0,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_zero_blocks() {
        let mut c = base();
        c.kv.total_kv_blocks = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_nan_coefficient() {
        let mut c = base();
        c.latency = LatencyConfig::Blackbox {
            beta_coeffs: [f64::NAN, 0.0, 0.0],
            alpha_coeffs: [0.0, 0.0, 0.0],
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_nonpositive_rate() {
        let mut c = base();
        c.rate = 0.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_unknown_scorer_name() {
        let mut c = base();
        c.routing.scorers.push(ScorerWeight {
            name: "bogus".into(),
            weight: 1.0,
        });
        assert!(c.validate().is_err());
    }
}
