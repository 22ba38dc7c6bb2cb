// src/estimation/mod.rs
//! Design-based point estimation and variance.

pub mod engine;
pub mod estimand;
pub mod replication;
pub mod taylor;

pub use engine::{compute, EngineOptions, VarianceMethod, VarianceResult};
pub use estimand::{
    collapse_to_psu, ht_response, sum_category_columns, Estimand, RatioMode, ResponseKind,
    SurveyMethod,
};
pub use replication::{replicate_estimates, variance_from_replicates};
pub use taylor::LonelyPsuRule;
