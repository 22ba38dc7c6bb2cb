// src/design/diagnostics.rs
//! Structural audit of a sampling design, independent of any response.
//!
//! Meant to run automatically alongside estimation, so it never fails:
//! every finding is a warning with remediation text, and an unreadable
//! column becomes a finding rather than an error.

use serde::Serialize;
use std::collections::HashMap;

use crate::design::sampling::SamplingDesign;

/// Minimum overall sample size for stable variance estimation.
const MIN_OVERALL_N: usize = 30;
/// Minimum units per stratum.
const MIN_STRATUM_N: usize = 5;
/// Minimum units per cluster.
const MIN_CLUSTER_N: usize = 3;
/// Weight coefficient-of-variation threshold.
const MAX_WEIGHT_CV: f64 = 1.0;
/// Max/min weight ratio threshold.
const MAX_WEIGHT_RATIO: f64 = 10.0;
/// Single-weight-to-mean ratio threshold.
const MAX_WEIGHT_TO_MEAN: f64 = 5.0;

/// Outcome of [`diagnose`]: non-fatal findings with remediation guidance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DesignAudit {
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl DesignAudit {
    fn flag(&mut self, warning: impl Into<String>, recommendation: impl Into<String>) {
        self.warnings.push(warning.into());
        self.recommendations.push(recommendation.into());
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Audit the design's structure: singleton strata/clusters, weight
/// dispersion, sample-size adequacy and missing finite-population
/// correction.
pub fn diagnose(design: &SamplingDesign) -> DesignAudit {
    let mut audit = DesignAudit::default();
    let n = design.n();

    if n < MIN_OVERALL_N {
        audit.flag(
            format!(
                "overall sample size {} is below {}; variance estimates may be unstable",
                n, MIN_OVERALL_N
            ),
            "collect more sampling days or pool across strata before estimation".to_string(),
        );
    }

    audit_weights(design, &mut audit);
    audit_groups(design, true, &mut audit);
    audit_groups(design, false, &mut audit);

    if design.fpc_col().is_none() {
        audit.flag(
            "no finite-population correction supplied (informational)",
            "provide per-stratum population sizes if the sampled fraction is non-negligible",
        );
    }

    audit
}

fn audit_weights(design: &SamplingDesign, audit: &mut DesignAudit) {
    let weights = match design.weights() {
        Ok(w) => w,
        Err(e) => {
            audit.flag(
                format!("weight column `{}` unreadable: {}", design.weight_col(), e),
                "check that the weight column exists and is numeric",
            );
            return;
        }
    };

    let values: Vec<f64> = weights
        .into_iter()
        .flatten()
        .filter(|w| w.is_finite() && *w > 0.0)
        .collect();
    if values.len() < 2 {
        return;
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|w| (w - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let cv = var.sqrt() / mean;
    let max = values.iter().cloned().fold(f64::MIN, f64::max);
    let min = values.iter().cloned().fold(f64::MAX, f64::min);

    if cv > MAX_WEIGHT_CV {
        audit.flag(
            format!("weight coefficient of variation {:.2} exceeds {:.0}", cv, MAX_WEIGHT_CV),
            "consider trimming extreme weights or calibrating to known totals",
        );
    }
    if min > 0.0 && max / min > MAX_WEIGHT_RATIO {
        audit.flag(
            format!(
                "max/min weight ratio {:.1} exceeds {:.0}",
                max / min,
                MAX_WEIGHT_RATIO
            ),
            "consider trimming the largest weights",
        );
    }
    let n_large = values.iter().filter(|w| **w > MAX_WEIGHT_TO_MEAN * mean).count();
    if n_large > 0 {
        audit.flag(
            format!(
                "{} weight(s) exceed {:.0}x the mean weight",
                n_large, MAX_WEIGHT_TO_MEAN
            ),
            "inspect those units; a single dominant weight can drive the whole estimate",
        );
    }
}

fn audit_groups(design: &SamplingDesign, strata: bool, audit: &mut DesignAudit) {
    let (label, min_n, col) = if strata {
        ("stratum", MIN_STRATUM_N, design.strata())
    } else {
        ("cluster", MIN_CLUSTER_N, design.psus())
    };
    let col = match col {
        Ok(Some(c)) => c,
        Ok(None) => return,
        Err(e) => {
            audit.flag(
                format!("{} column unreadable: {}", label, e),
                "check the design's column names",
            );
            return;
        }
    };

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for v in col.into_iter().flatten() {
        *counts.entry(v).or_insert(0) += 1;
    }

    let mut singletons: Vec<&str> = counts
        .iter()
        .filter(|(_, c)| **c == 1)
        .map(|(k, _)| *k)
        .collect();
    singletons.sort_unstable();
    for name in &singletons {
        audit.flag(
            format!("singleton {} `{}` (exactly one unit)", label, name),
            format!(
                "merge `{}` with a neighbouring {} or rely on the lonely-PSU \
                 grand-mean adjustment applied by the variance engine",
                name, label
            ),
        );
    }

    let mut thin: Vec<(&str, usize)> = counts
        .iter()
        .filter(|(_, c)| **c > 1 && **c < min_n)
        .map(|(k, c)| (*k, *c))
        .collect();
    thin.sort_unstable();
    for (name, c) in thin {
        audit.flag(
            format!(
                "{} `{}` has {} unit(s), fewer than {}; insufficient for stable variance",
                label, name, c, min_n
            ),
            "merge small groups or collect additional units before estimation",
        );
    }
}
