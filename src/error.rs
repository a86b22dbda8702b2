//! Crate-wide typed errors. Library code never panics except for the one
//! documented fatal invariant violation (KV-conservation breach — see
//! [`crate::kv::store`]); everything else is a typed, recoverable `Result`.

use thiserror::Error;

/// Configuration validation failures, surfaced fail-fast at simulation
/// construction time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown {field} {:?}: valid values are {valid:?}", got)]
    UnknownEnumValue {
        field: &'static str,
        got: String,
        valid: &'static [&'static str],
    },

    #[error("missing required config field: {0}")]
    MissingField(&'static str),

    #[error("{field} must be > 0, got {got}")]
    MustBePositive { field: &'static str, got: f64 },

    #[error("{field} must be >= 0, got {got}")]
    MustBeNonNegative { field: &'static str, got: f64 },

    #[error("{field} coefficient is NaN or Inf: {got}")]
    NonFiniteCoefficient { field: String, got: f64 },

    #[error("scorer weight for {name:?} must be > 0, got {weight}")]
    NonPositiveScorerWeight { name: String, weight: f64 },

    #[error("unknown fitness metric key: {0:?}")]
    UnknownFitnessMetric(String),
}

/// Admission-policy decision failure path is modeled as `Decision::Reject`,
/// not an error — this enum exists only for admission *construction*
/// failures (e.g. invalid token-bucket parameters), which surface as
/// [`ConfigError`] instead. Retained as a marker type for API symmetry with
/// the other policy planes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("admission policy misconfigured: {0}")]
    Misconfigured(String),
}
