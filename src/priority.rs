//! Priority policy: computes a per-request scalar consumed by the instance
//! scheduler before each step's batch formation.

use serde::{Deserialize, Serialize};

use crate::clock::Tick;
use crate::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityKind {
    Constant,
    SloBased,
    InvertedSlo,
}

pub trait PriorityPolicy {
    fn compute(&self, req: &Request, clock: Tick) -> f64;
}

/// Always `0`. Combined with `PriorityFcfs` this degrades to plain FCFS.
pub struct Constant;

impl PriorityPolicy for Constant {
    fn compute(&self, _req: &Request, _clock: Tick) -> f64 {
        0.0
    }
}

/// `base + ageWeight * (clock - arrival)`: older requests gain priority.
pub struct SloBased {
    pub base: f64,
    pub age_weight: f64,
}

impl PriorityPolicy for SloBased {
    fn compute(&self, req: &Request, clock: Tick) -> f64 {
        let age = clock.saturating_sub(req.arrival_time) as f64;
        self.base + self.age_weight * age
    }
}

/// `base - ageWeight * (clock - arrival)`. Pathological: penalizes age
/// instead of rewarding it, kept to exercise scheduler/priority
/// misconfiguration scenarios deliberately.
pub struct InvertedSlo {
    pub base: f64,
    pub age_weight: f64,
}

impl PriorityPolicy for InvertedSlo {
    fn compute(&self, req: &Request, clock: Tick) -> f64 {
        let age = clock.saturating_sub(req.arrival_time) as f64;
        self.base - self.age_weight * age
    }
}

pub fn build(kind: PriorityKind, base: f64, age_weight: f64) -> Box<dyn PriorityPolicy + Send + Sync> {
    match kind {
        PriorityKind::Constant => Box::new(Constant),
        PriorityKind::SloBased => Box::new(SloBased { base, age_weight }),
        PriorityKind::InvertedSlo => Box::new(InvertedSlo { base, age_weight }),
    }
}
