//! Admission policy: the first gate a request passes through in cluster
//! mode, before routing ever sees it.

use serde::{Deserialize, Serialize};

use crate::clock::Tick;
use crate::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionKind {
    AlwaysAdmit,
    TokenBucket,
    RejectAll,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Admit,
    Reject(&'static str),
}

pub trait AdmissionPolicy {
    fn decide(&mut self, req: &Request, clock: Tick) -> Decision;
}

pub struct AlwaysAdmit;

impl AdmissionPolicy for AlwaysAdmit {
    fn decide(&mut self, _req: &Request, _clock: Tick) -> Decision {
        Decision::Admit
    }
}

pub struct RejectAll;

impl AdmissionPolicy for RejectAll {
    fn decide(&mut self, _req: &Request, _clock: Tick) -> Decision {
        Decision::Reject("reject-all policy")
    }
}

/// Cost of admitting a request is `len(InputTokens)` tokens; the bucket
/// refills continuously at `refill_rate` tokens/sec, capped at `capacity`.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    current_tokens: f64,
    last_refill_tick: Tick,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            current_tokens: capacity,
            last_refill_tick: Tick::ZERO,
        }
    }
}

impl AdmissionPolicy for TokenBucket {
    fn decide(&mut self, req: &Request, clock: Tick) -> Decision {
        let elapsed_ticks = clock.saturating_sub(self.last_refill_tick) as f64;
        self.current_tokens =
            (self.current_tokens + elapsed_ticks * self.refill_rate / 1e6).min(self.capacity);
        self.last_refill_tick = clock;

        let cost = req.input_tokens.len() as f64;
        if self.current_tokens >= cost {
            self.current_tokens -= cost;
            Decision::Admit
        } else {
            Decision::Reject("insufficient tokens")
        }
    }
}

pub fn build(kind: AdmissionKind, capacity: f64, refill_rate: f64) -> Box<dyn AdmissionPolicy + Send + Sync> {
    match kind {
        AdmissionKind::AlwaysAdmit => Box::new(AlwaysAdmit),
        AdmissionKind::TokenBucket => Box::new(TokenBucket::new(capacity, refill_rate)),
        AdmissionKind::RejectAll => Box::new(RejectAll),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SloClass;

    fn req(input: usize) -> Request {
        Request::new(1, Tick(0), vec![0; input], vec![0; 1], SloClass::Standard, 0, 0)
    }

    #[test]
    fn always_admit_never_rejects() {
        let mut p = AlwaysAdmit;
        assert_eq!(p.decide(&req(1_000_000), Tick(0)), Decision::Admit);
    }

    #[test]
    fn reject_all_always_rejects() {
        let mut p = RejectAll;
        assert_eq!(p.decide(&req(1), Tick(0)), Decision::Reject("reject-all policy"));
    }

    #[test]
    fn token_bucket_admits_initial_burst_then_rejects() {
        let mut p = TokenBucket::new(1000.0, 100.0);
        assert_eq!(p.decide(&req(512), Tick(0)), Decision::Admit);
        assert_eq!(p.decide(&req(512), Tick(0)), Decision::Reject("insufficient tokens"));
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let mut p = TokenBucket::new(1000.0, 1_000_000.0); // 1M tokens/sec
        p.decide(&req(1000), Tick(0)); // drain to 0
        // 1 second later (1e6 ticks), fully refilled.
        assert_eq!(p.decide(&req(1000), Tick(1_000_000)), Decision::Admit);
    }
}
