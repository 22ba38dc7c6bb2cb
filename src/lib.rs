// src/lib.rs
//! Design-based estimation for creel (angler) surveys.
//!
//! The crate estimates fishing effort, catch rate and harvest from
//! stratified, clustered on-site survey data, with honest variances:
//!
//! - [`SamplingDesign`] declares weights, strata, clusters,
//!   finite-population corrections and optional replicate weights over a
//!   [`polars`] data frame.
//! - [`Estimand`] names what to estimate: a total, or a ratio in either
//!   the ratio-of-means or mean-of-ratios sense, optionally per group.
//! - [`compute`] produces per-group estimates with standard errors,
//!   confidence intervals and design effects by Taylor linearization,
//!   bootstrap, jackknife, or a supplied replicate-weight matrix,
//!   falling back to linearization when a replication method cannot run.
//! - [`decompose`] splits the response variance across the design
//!   hierarchy and turns it into allocation advice for the next season.
//! - [`combine`] multiplies independently estimated effort and
//!   catch-per-unit-effort into total harvest with a delta-method
//!   variance.
//! - [`diagnose`] audits a design for structural trouble (extreme
//!   weights, singleton strata, thin clusters) without ever failing.
//!
//! Failures local to one estimation group degrade to a NaN estimate with
//! a fatal diagnostic on that group; failures that invalidate a whole
//! call return [`SvyError`].

pub mod combine;
pub mod decompose;
pub mod design;
pub mod error;
pub mod estimation;

pub use combine::{combine, Correlation};
pub use decompose::{decompose, AllocationAdvice, VarianceComponent, VarianceComponents};
pub use design::{
    bootstrap_weights, diagnose, jackknife_weights, DesignAudit, RepWeightKind, ReplicateWeights,
    SamplingDesign,
};
pub use error::{Diagnostic, DiagnosticCode, Result, Severity, SvyError};
pub use estimation::{
    collapse_to_psu, compute, ht_response, sum_category_columns, EngineOptions, Estimand,
    LonelyPsuRule, RatioMode, ResponseKind, SurveyMethod, VarianceMethod, VarianceResult,
};
