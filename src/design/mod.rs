// src/design/mod.rs

pub mod diagnostics;
pub mod replicate;
pub mod sampling;

pub use diagnostics::{diagnose, DesignAudit};
pub use replicate::{bootstrap_weights, jackknife_weights, MIN_BOOTSTRAP_PSUS};
pub use sampling::{RepWeightKind, ReplicateWeights, SamplingDesign};
