// src/estimation/engine.rs
//! The variance engine: one entry point that takes a design, an estimand
//! and a variance method and produces per-group point estimates with
//! standard errors, confidence intervals and design effects.
//!
//! Method selection is recoverable and observable: when a requested
//! replication method cannot run on a group (too few clusters, degenerate
//! replicates), the engine falls back to linearization, records the
//! fallback in the result's diagnostics and `method` field, and logs it.

use polars::prelude::*;
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::HashMap;

use crate::design::replicate::{bootstrap_weights, jackknife_weights};
use crate::design::sampling::{ReplicateWeights, SamplingDesign};
use crate::error::{Diagnostic, DiagnosticCode, Result, SvyError};
use crate::estimation::estimand::{Estimand, RatioMode, ResponseKind};
use crate::estimation::replication::{replicate_estimates, variance_from_replicates};
use crate::estimation::taylor::{
    degrees_of_freedom, index_categorical, point_estimate_mean, point_estimate_ratio,
    point_estimate_total, scores_mean, scores_ratio, scores_total, srs_variance_mean,
    srs_variance_ratio, srs_variance_total, taylor_variance, LonelyPsuRule,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarianceMethod {
    #[default]
    Linearization,
    Bootstrap,
    Jackknife,
    /// Use the replicate-weight matrix already attached to the design.
    ReplicatePassthrough,
}

impl VarianceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            VarianceMethod::Linearization => "linearization",
            VarianceMethod::Bootstrap => "bootstrap",
            VarianceMethod::Jackknife => "jackknife",
            VarianceMethod::ReplicatePassthrough => "replicate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub conf_level: f64,
    pub n_replicates: usize,
    pub seed: u64,
    pub lonely_psu: LonelyPsuRule,
    pub compute_deff: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            conf_level: 0.95,
            n_replicates: 1000,
            seed: 0,
            lonely_psu: LonelyPsuRule::default(),
            compute_deff: true,
        }
    }
}

/// One estimated group: the point estimate with its uncertainty and
/// everything the engine wants the caller to know about how it got there.
#[derive(Debug, Clone, Serialize)]
pub struct VarianceResult {
    /// Group tuple values in `group_by` column order; `None` for an
    /// ungrouped estimate.
    pub group: Option<Vec<String>>,
    pub estimate: f64,
    pub se: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    /// Ratio of the design variance to the variance of a simple random
    /// sample of the same size; NaN when not computable.
    pub deff: f64,
    /// The variance method actually used, which differs from the request
    /// after a fallback.
    pub method: String,
    pub n_used: usize,
    pub degrees_of_freedom: usize,
    pub diagnostics: Vec<Diagnostic>,
}

/// Estimate `estimand` over `design` with `method`, independently per
/// group tuple when the estimand is grouped.
///
/// A failure local to one group does not abort the others: that group
/// comes back with a NaN estimate and a fatal diagnostic. Failures that
/// invalidate the whole call (bad design, missing response columns,
/// invalid options) return `Err`.
pub fn compute(
    design: &SamplingDesign,
    estimand: &Estimand,
    method: VarianceMethod,
    opts: &EngineOptions,
) -> Result<Vec<VarianceResult>> {
    design.validate()?;
    if !(opts.conf_level > 0.0 && opts.conf_level < 1.0) {
        return Err(SvyError::InvalidArgument(format!(
            "confidence level must lie in (0, 1), got {}",
            opts.conf_level
        )));
    }
    if opts.n_replicates < 2 {
        return Err(SvyError::InvalidArgument(
            "at least 2 replicates are required".into(),
        ));
    }

    let frame = design.frame();
    // Resolve response columns up front so a typo fails the whole call
    // instead of every group.
    match estimand.kind() {
        ResponseKind::Total { response } => {
            frame.column(response)?.f64()?;
        }
        ResponseKind::Ratio {
            numerator,
            denominator,
            ..
        } => {
            frame.column(numerator)?.f64()?;
            frame.column(denominator)?.f64()?;
        }
    }

    let group_chunks: Vec<&StringChunked> = estimand
        .group_cols()
        .iter()
        .map(|c| frame.column(c).and_then(|s| s.str()))
        .collect::<PolarsResult<_>>()?;

    // First-appearance ordering of group tuples; rows with a null group
    // value belong to no group.
    let n = design.n();
    let mut order: Vec<Vec<String>> = Vec::new();
    let mut index: HashMap<Vec<String>, usize> = HashMap::new();
    let mut row_group: Vec<Option<usize>> = Vec::with_capacity(n);
    let mut null_group_rows = 0usize;
    for i in 0..n {
        if group_chunks.is_empty() {
            row_group.push(Some(0));
            continue;
        }
        let mut key = Vec::with_capacity(group_chunks.len());
        let mut null = false;
        for g in &group_chunks {
            match g.get(i) {
                Some(v) => key.push(v.to_string()),
                None => {
                    null = true;
                    break;
                }
            }
        }
        if null {
            null_group_rows += 1;
            row_group.push(None);
            continue;
        }
        let idx = *index.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            order.len() - 1
        });
        row_group.push(Some(idx));
    }
    let n_groups = if group_chunks.is_empty() {
        1
    } else {
        order.len()
    };
    if n_groups == 0 {
        return Err(SvyError::Estimand {
            column: estimand.group_cols().join(", "),
            detail: "grouping produced no groups".into(),
        });
    }
    if null_group_rows > 0 {
        log::warn!(
            "{} row(s) with a null grouping value excluded from every group",
            null_group_rows
        );
    }

    let mut results = Vec::with_capacity(n_groups);
    for g in 0..n_groups {
        let group = if group_chunks.is_empty() {
            None
        } else {
            Some(order[g].clone())
        };
        let mut result =
            match estimate_group(design, estimand, method, opts, &row_group, g, group.clone()) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("group {:?} failed: {}", group, e);
                    failed_group(group, method, e)
                }
            };
        if null_group_rows > 0 {
            result.diagnostics.push(Diagnostic::warning(
                DiagnosticCode::ExcludedUnits,
                format!(
                    "{} row(s) with a null grouping value excluded",
                    null_group_rows
                ),
                null_group_rows,
            ));
        }
        results.push(result);
    }
    Ok(results)
}

fn failed_group(
    group: Option<Vec<String>>,
    method: VarianceMethod,
    err: SvyError,
) -> VarianceResult {
    VarianceResult {
        group,
        estimate: f64::NAN,
        se: f64::NAN,
        ci_low: f64::NAN,
        ci_high: f64::NAN,
        deff: f64::NAN,
        method: method.as_str().to_string(),
        n_used: 0,
        degrees_of_freedom: 0,
        diagnostics: vec![Diagnostic::fatal(
            DiagnosticCode::GroupFailed,
            err.to_string(),
            0,
        )],
    }
}

#[allow(clippy::too_many_arguments)]
fn estimate_group(
    design: &SamplingDesign,
    estimand: &Estimand,
    method: VarianceMethod,
    opts: &EngineOptions,
    row_group: &[Option<usize>],
    g: usize,
    group: Option<Vec<String>>,
) -> Result<VarianceResult> {
    let frame = design.frame();
    let w_all = design.weights()?;
    let (y_all, x_all) = match estimand.kind() {
        ResponseKind::Total { response } => (frame.column(response)?.f64()?, None),
        ResponseKind::Ratio {
            numerator,
            denominator,
            ..
        } => (
            frame.column(numerator)?.f64()?,
            Some(frame.column(denominator)?.f64()?),
        ),
    };
    let mean_of_ratios = matches!(
        estimand.kind(),
        ResponseKind::Ratio {
            mode: RatioMode::MeanOfRatios,
            ..
        }
    );

    // Row validity inside the group: usable weight and response. For the
    // mean-of-ratios mode a missing or non-positive denominator excludes
    // the unit rather than poisoning the mean.
    let mut mask = vec![false; design.n()];
    let mut excluded = 0usize;
    for (i, m) in mask.iter_mut().enumerate() {
        if row_group[i] != Some(g) {
            continue;
        }
        let w_ok = w_all.get(i).is_some_and(|w| w.is_finite() && w > 0.0);
        let y_ok = y_all.get(i).is_some_and(f64::is_finite);
        let x_ok = match &x_all {
            None => true,
            Some(x) => x.get(i).is_some_and(|v| {
                v.is_finite() && (!mean_of_ratios || v > 0.0)
            }),
        };
        if w_ok && y_ok && x_ok {
            *m = true;
        } else {
            excluded += 1;
        }
    }

    let mut diagnostics = Vec::new();
    if excluded > 0 {
        diagnostics.push(Diagnostic::warning(
            DiagnosticCode::ExcludedUnits,
            format!("{} unusable row(s) excluded before estimation", excluded),
            excluded,
        ));
    }

    let subset = design.subset(&BooleanChunked::from_slice("keep".into(), &mask))?;
    let n_used = subset.n();
    if n_used == 0 {
        return Err(SvyError::Estimand {
            column: estimand.group_cols().join(", "),
            detail: "no usable rows in group".into(),
        });
    }
    if n_used < 3 {
        diagnostics.push(Diagnostic::warning(
            DiagnosticCode::UnstableGroup,
            format!("only {} usable row(s); estimates are unstable", n_used),
            n_used,
        ));
    }

    let w = subset.base_weights()?;
    let to_vec = |c: &Float64Chunked| -> Vec<f64> {
        c.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect()
    };
    let sub_frame = subset.frame();
    let (y, x): (Vec<f64>, Option<Vec<f64>>) = match estimand.kind() {
        ResponseKind::Total { response } => (to_vec(sub_frame.column(response)?.f64()?), None),
        ResponseKind::Ratio {
            numerator,
            denominator,
            ..
        } => (
            to_vec(sub_frame.column(numerator)?.f64()?),
            Some(to_vec(sub_frame.column(denominator)?.f64()?)),
        ),
    };
    // Per-unit ratios for the mean-of-ratios mode; denominators were
    // screened positive above.
    let z: Option<Vec<f64>> = if mean_of_ratios {
        let x = x.as_ref().ok_or_else(|| {
            SvyError::InvalidArgument("mean-of-ratios without a denominator".into())
        })?;
        Some(y.iter().zip(x.iter()).map(|(yi, xi)| yi / xi).collect())
    } else {
        None
    };

    let estimate = match (estimand.kind(), &z, &x) {
        (ResponseKind::Total { .. }, _, _) => point_estimate_total(&y, &w),
        (_, Some(z), _) => point_estimate_mean(z, &w),
        (_, None, Some(x)) => point_estimate_ratio(&y, x, &w),
        _ => f64::NAN,
    };

    // Linearization machinery, also the fallback target for replication.
    let strata_idx = subset.strata()?.map(|s| index_categorical(s).0);
    let psu_idx = subset.psus()?.map(|s| index_categorical(s).0);
    let fpc: Option<Vec<f64>> = subset
        .fpc()?
        .map(|f| f.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect());
    let dof = degrees_of_freedom(n_used, strata_idx.as_deref(), psu_idx.as_deref());

    let linearized = |diagnostics: &mut Vec<Diagnostic>| -> f64 {
        let scores = match (estimand.kind(), &z, &x) {
            (ResponseKind::Total { .. }, _, _) => scores_total(&y, &w),
            (_, Some(z), _) => scores_mean(z, &w),
            (_, None, Some(x)) => scores_ratio(&y, x, &w),
            _ => Vec::new(),
        };
        let (var, lonely) = taylor_variance(
            &scores,
            strata_idx.as_deref(),
            psu_idx.as_deref(),
            opts.lonely_psu,
            fpc.as_deref(),
        );
        if lonely {
            diagnostics.push(Diagnostic::warning(
                DiagnosticCode::LonelyPsuAdjusted,
                "single-cluster stratum contribution centered on the grand mean",
                1,
            ));
        }
        var
    };

    let theta = |wr: &[f64]| -> f64 {
        match (estimand.kind(), &z, &x) {
            (ResponseKind::Total { .. }, _, _) => point_estimate_total(&y, wr),
            (_, Some(z), _) => point_estimate_mean(z, wr),
            (_, None, Some(x)) => point_estimate_ratio(&y, x, wr),
            _ => f64::NAN,
        }
    };
    let replicated = |reps: &ReplicateWeights, diagnostics: &mut Vec<Diagnostic>| -> f64 {
        let theta_reps = replicate_estimates(reps, theta);
        let (var, skipped) = variance_from_replicates(&theta_reps, reps.scale, &reps.rscales);
        if skipped > 0 {
            diagnostics.push(Diagnostic::warning(
                DiagnosticCode::UnstableGroup,
                format!("{} non-finite replicate estimate(s) skipped", skipped),
                skipped,
            ));
        }
        var
    };
    let fall_back = |reason: String, diagnostics: &mut Vec<Diagnostic>| -> f64 {
        log::warn!(
            "{} unavailable for group {:?}, falling back to linearization: {}",
            method.as_str(),
            group,
            reason
        );
        diagnostics.push(Diagnostic::warning(
            DiagnosticCode::MethodFallback,
            format!(
                "{} unavailable ({}); linearization used instead",
                method.as_str(),
                reason
            ),
            0,
        ));
        linearized(diagnostics)
    };

    let mut used = method;
    let variance = match method {
        VarianceMethod::Linearization => linearized(&mut diagnostics),
        VarianceMethod::Bootstrap => {
            match bootstrap_weights(&subset, opts.n_replicates, opts.seed) {
                Ok(reps) => {
                    let var = replicated(&reps, &mut diagnostics);
                    if var.is_finite() {
                        var
                    } else {
                        used = VarianceMethod::Linearization;
                        fall_back("degenerate replicate estimates".into(), &mut diagnostics)
                    }
                }
                Err(e) => {
                    used = VarianceMethod::Linearization;
                    fall_back(e.to_string(), &mut diagnostics)
                }
            }
        }
        VarianceMethod::Jackknife => match jackknife_weights(&subset) {
            Ok(reps) => {
                let var = replicated(&reps, &mut diagnostics);
                if var.is_finite() {
                    var
                } else {
                    used = VarianceMethod::Linearization;
                    fall_back("degenerate replicate estimates".into(), &mut diagnostics)
                }
            }
            Err(e) => {
                used = VarianceMethod::Linearization;
                fall_back(e.to_string(), &mut diagnostics)
            }
        },
        VarianceMethod::ReplicatePassthrough => match subset.replicates() {
            Some(reps) => {
                let reps = reps.clone();
                let var = replicated(&reps, &mut diagnostics);
                if var.is_finite() {
                    var
                } else {
                    used = VarianceMethod::Linearization;
                    fall_back("degenerate replicate estimates".into(), &mut diagnostics)
                }
            }
            None => {
                used = VarianceMethod::Linearization;
                fall_back("design carries no replicate weights".into(), &mut diagnostics)
            }
        },
    };

    let se = if variance.is_finite() && variance >= 0.0 {
        variance.sqrt()
    } else {
        f64::NAN
    };
    let zcrit = match Normal::new(0.0, 1.0) {
        Ok(dist) => dist.inverse_cdf(0.5 + opts.conf_level / 2.0),
        Err(_) => f64::NAN,
    };
    let (ci_low, ci_high) = (estimate - zcrit * se, estimate + zcrit * se);

    let deff = if opts.compute_deff {
        let srs = match (estimand.kind(), &z, &x) {
            (ResponseKind::Total { .. }, _, _) => srs_variance_total(&y, &w),
            (_, Some(z), _) => srs_variance_mean(z, &w),
            (_, None, Some(x)) => srs_variance_ratio(&y, x, &w),
            _ => f64::NAN,
        };
        if variance.is_finite() && srs.is_finite() && srs > 0.0 {
            variance / srs
        } else {
            f64::NAN
        }
    } else {
        f64::NAN
    };

    Ok(VarianceResult {
        group,
        estimate,
        se,
        ci_low,
        ci_high,
        deff,
        method: used.as_str().to_string(),
        n_used,
        degrees_of_freedom: dof,
        diagnostics,
    })
}
