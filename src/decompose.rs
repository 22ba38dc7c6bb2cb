// src/decompose.rs
//! Nested analysis-of-variance decomposition of a response across the
//! design hierarchy: where the variance lives, how strongly units within
//! a cluster resemble each other, and what that implies for allocating
//! the next season's sampling effort.

use polars::prelude::*;
use serde::Serialize;
use std::collections::HashMap;

use crate::design::sampling::SamplingDesign;
use crate::error::{Diagnostic, DiagnosticCode, Result, SvyError};
use crate::estimation::estimand::{Estimand, ResponseKind};

pub const RESIDUAL_LEVEL: &str = "residual";

/// One level of the hierarchy: its variance component and the clustering
/// summaries derived from it. The residual (within innermost level)
/// component carries NaN for the intraclass correlation and design
/// effect, which are cluster notions.
#[derive(Debug, Clone, Serialize)]
pub struct VarianceComponent {
    pub level: String,
    pub variance: f64,
    /// Share of the summed components attributed to this level.
    pub proportion: f64,
    /// Intraclass correlation: this component over the variance remaining
    /// at this level and inward (inner components plus the residual).
    pub icc: f64,
    /// `1 + (avg_cluster_size - 1) * icc`.
    pub design_effect: f64,
    pub avg_cluster_size: f64,
    /// True when a negative method-of-moments estimate was clamped to
    /// zero.
    pub clamped: bool,
}

/// Where to put the next unit of sampling effort.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationAdvice {
    /// `sqrt(between / within)`: optimal within-cluster sample size under
    /// equal unit costs.
    pub ratio: f64,
    pub guidance: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VarianceComponents {
    /// One entry per hierarchy level, outermost first, then the residual.
    pub components: Vec<VarianceComponent>,
    pub optimal_allocation: Option<AllocationAdvice>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Decompose the estimand's per-unit response into variance components
/// across `levels` (outermost first, e.g. stratum then day).
///
/// Components come from the balanced-design method of moments on the
/// unweighted responses: mean squares per level, then
/// `(MS_level - MS_inner) / avg_group_size` walked from the inside out.
/// Negative estimates are clamped to zero and flagged. Rows missing the
/// response or any level value are excluded and counted.
pub fn decompose(
    design: &SamplingDesign,
    estimand: &Estimand,
    levels: &[&str],
) -> Result<VarianceComponents> {
    if levels.is_empty() {
        return Err(SvyError::InvalidArgument(
            "at least one hierarchy level is required".into(),
        ));
    }
    let frame = design.frame();
    let level_chunks: Vec<&StringChunked> = levels
        .iter()
        .map(|c| frame.column(c).and_then(|s| s.str()))
        .collect::<PolarsResult<_>>()?;

    // Per-unit response values; for ratio estimands the unit-level ratio.
    let (y_col, x_col) = match estimand.kind() {
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
    let ratio = matches!(estimand.kind(), ResponseKind::Ratio { .. });

    let mut rows: Vec<(Vec<String>, f64)> = Vec::new();
    let mut excluded = 0usize;
    'rows: for i in 0..design.n() {
        let value = match (y_col.get(i), x_col.as_ref().and_then(|x| x.get(i))) {
            (Some(y), Some(x)) if ratio && x.is_finite() && x > 0.0 && y.is_finite() => y / x,
            (Some(y), _) if !ratio && y.is_finite() => y,
            _ => {
                excluded += 1;
                continue;
            }
        };
        let mut key = Vec::with_capacity(levels.len());
        for lc in &level_chunks {
            match lc.get(i) {
                Some(v) => key.push(v.to_string()),
                None => {
                    excluded += 1;
                    continue 'rows;
                }
            }
        }
        rows.push((key, value));
    }

    let n = rows.len();
    if n < 2 {
        return Err(SvyError::Estimand {
            column: levels.join(", "),
            detail: format!("{} usable row(s); decomposition needs at least 2", n),
        });
    }

    let mut diagnostics = Vec::new();
    if excluded > 0 {
        diagnostics.push(Diagnostic::warning(
            DiagnosticCode::ExcludedUnits,
            format!("{} row(s) excluded from the decomposition", excluded),
            excluded,
        ));
    }

    // Group means per nesting depth: depth k groups on the first k+1
    // level values.
    let n_levels = levels.len();
    let mut group_means: Vec<HashMap<&[String], (usize, f64)>> = Vec::with_capacity(n_levels);
    for k in 0..n_levels {
        let mut acc: HashMap<&[String], (usize, f64)> = HashMap::new();
        for (key, v) in &rows {
            let e = acc.entry(&key[..=k]).or_insert((0, 0.0));
            e.0 += 1;
            e.1 += v;
        }
        group_means.push(acc);
    }
    let grand_mean = rows.iter().map(|(_, v)| v).sum::<f64>() / n as f64;
    let mean_at = |k: usize, key: &[String]| -> f64 {
        let (c, s) = group_means[k][&key[..=k]];
        s / c as f64
    };

    // Sums of squares and degrees of freedom, one per level plus the
    // residual.
    let mut ss = vec![0.0f64; n_levels + 1];
    for (key, v) in &rows {
        for k in 0..n_levels {
            let parent = if k == 0 { grand_mean } else { mean_at(k - 1, key) };
            ss[k] += (mean_at(k, key) - parent).powi(2);
        }
        ss[n_levels] += (v - mean_at(n_levels - 1, key)).powi(2);
    }
    let n_groups: Vec<usize> = (0..n_levels).map(|k| group_means[k].len()).collect();
    let mut dfs = vec![0isize; n_levels + 1];
    for k in 0..n_levels {
        let outer = if k == 0 { 1 } else { n_groups[k - 1] };
        dfs[k] = n_groups[k] as isize - outer as isize;
    }
    dfs[n_levels] = n as isize - n_groups[n_levels - 1] as isize;
    let ms: Vec<f64> = ss
        .iter()
        .zip(dfs.iter())
        .map(|(s, &d)| if d > 0 { s / d as f64 } else { f64::NAN })
        .collect();
    if ms.iter().any(|m| m.is_nan()) {
        diagnostics.push(Diagnostic::warning(
            DiagnosticCode::UnstableGroup,
            "a hierarchy level adds no grouping beyond its parent; its component is undefined",
            0,
        ));
    }

    // Method-of-moments components, inside out, negatives clamped.
    let avg_sizes: Vec<f64> = (0..n_levels).map(|k| n as f64 / n_groups[k] as f64).collect();
    let mut variances = vec![f64::NAN; n_levels + 1];
    let mut clamped_flags = vec![false; n_levels + 1];
    variances[n_levels] = ms[n_levels];
    let mut n_clamped = 0usize;
    for k in (0..n_levels).rev() {
        let raw = (ms[k] - ms[k + 1]) / avg_sizes[k];
        if raw < 0.0 {
            variances[k] = 0.0;
            clamped_flags[k] = true;
            n_clamped += 1;
        } else {
            variances[k] = raw;
        }
    }
    if n_clamped > 0 {
        diagnostics.push(Diagnostic::warning(
            DiagnosticCode::ComponentClamped,
            format!("{} negative variance component(s) clamped to zero", n_clamped),
            n_clamped,
        ));
    }

    let total: f64 = variances.iter().filter(|v| v.is_finite()).sum();
    // Tail sums: the variance remaining at this level and inward. The
    // intraclass correlation at a level is its component over that tail,
    // not over the grand total, so outer-level variance does not dilute
    // inner-level clustering.
    let mut tails = vec![0.0f64; n_levels + 2];
    for k in (0..=n_levels).rev() {
        tails[k] = tails[k + 1] + if variances[k].is_finite() { variances[k] } else { 0.0 };
    }
    let mut components = Vec::with_capacity(n_levels + 1);
    for k in 0..=n_levels {
        let is_residual = k == n_levels;
        let proportion = if total > 0.0 {
            variances[k] / total
        } else {
            f64::NAN
        };
        let (icc, design_effect, avg_cluster_size) = if is_residual {
            (f64::NAN, f64::NAN, 1.0)
        } else {
            let icc = if tails[k] > 0.0 {
                variances[k] / tails[k]
            } else {
                f64::NAN
            };
            (icc, 1.0 + (avg_sizes[k] - 1.0) * icc, avg_sizes[k])
        };
        components.push(VarianceComponent {
            level: if is_residual {
                RESIDUAL_LEVEL.to_string()
            } else {
                levels[k].to_string()
            },
            variance: variances[k],
            proportion,
            icc,
            design_effect,
            avg_cluster_size,
            clamped: clamped_flags[k],
        });
    }

    let optimal_allocation = allocation_advice(&components);
    Ok(VarianceComponents {
        components,
        optimal_allocation,
        diagnostics,
    })
}

/// Neyman-style allocation under equal unit costs: the optimal number of
/// units per outermost cluster scales with `sqrt(between / within)`.
fn allocation_advice(components: &[VarianceComponent]) -> Option<AllocationAdvice> {
    let between = components.first()?.variance;
    let within = components.last()?.variance;
    if !between.is_finite() || !within.is_finite() || within <= 0.0 {
        return None;
    }
    let ratio = (between / within).sqrt();
    let guidance = if ratio >= 1.0 {
        format!(
            "most variance sits between {} groups; spread effort across more of them \
             rather than sampling each more intensively",
            components[0].level
        )
    } else {
        format!(
            "most variance sits within {} groups; sample each more intensively \
             before adding new ones",
            components[0].level
        )
    };
    Some(AllocationAdvice { ratio, guidance })
}
