// src/estimation/estimand.rs
//! Per-unit responses the variance engine estimates over: totals and
//! ratios, Horvitz–Thompson expansion with probability clamping, species
//! aggregation ahead of ratio estimation, and the day-level (PSU)
//! collapse for count-based effort responses.

use polars::prelude::*;
use std::collections::HashMap;

use crate::design::sampling::SamplingDesign;
use crate::error::{Diagnostic, DiagnosticCode, Result, SvyError};

/// Which ratio estimator a ratio estimand uses. Both are reported by name
/// in results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RatioMode {
    /// `sum(w*num) / sum(w*den)`, robust when per-unit effort varies
    /// widely; the default.
    #[default]
    RatioOfMeans,
    /// Weighted mean of per-unit `num/den`, only for commensurate
    /// per-unit ratios (e.g. complete trips). Units with a missing or
    /// non-positive denominator are excluded, never coerced to zero.
    MeanOfRatios,
}

impl RatioMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatioMode::RatioOfMeans => "ratio_of_means",
            RatioMode::MeanOfRatios => "mean_of_ratios",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResponseKind {
    /// Finite-population total of a per-unit response column.
    Total { response: String },
    /// Ratio of two per-unit columns (CPUE: catch over effort).
    Ratio {
        numerator: String,
        denominator: String,
        mode: RatioMode,
    },
}

/// A named response over the design's frame, optionally estimated
/// independently per distinct group tuple.
#[derive(Debug, Clone)]
pub struct Estimand {
    kind: ResponseKind,
    group_by: Vec<String>,
}

impl Estimand {
    pub fn total(response: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Total {
                response: response.into(),
            },
            group_by: Vec::new(),
        }
    }

    pub fn ratio(numerator: impl Into<String>, denominator: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Ratio {
                numerator: numerator.into(),
                denominator: denominator.into(),
                mode: RatioMode::RatioOfMeans,
            },
            group_by: Vec::new(),
        }
    }

    pub fn mean_of_ratios(
        numerator: impl Into<String>,
        denominator: impl Into<String>,
    ) -> Self {
        Self {
            kind: ResponseKind::Ratio {
                numerator: numerator.into(),
                denominator: denominator.into(),
                mode: RatioMode::MeanOfRatios,
            },
            group_by: Vec::new(),
        }
    }

    pub fn group_by<I, S>(mut self, cols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = cols.into_iter().map(Into::into).collect();
        self
    }

    pub fn kind(&self) -> &ResponseKind {
        &self.kind
    }

    pub fn group_cols(&self) -> &[String] {
        &self.group_by
    }
}

// ============================================================================
// Horvitz–Thompson expansion
// ============================================================================

/// Divide observed counts by their inclusion probabilities, clamping the
/// probabilities into `(eps, 1]`.
///
/// The division happens here, once, upstream of everything else. Any
/// probability outside `(0, 1]` is clamped *and* counted in the returned
/// diagnostics; a null count or probability yields a null response.
pub fn ht_response(
    observed: &Float64Chunked,
    inclusion_prob: &Float64Chunked,
    eps: f64,
) -> Result<(Float64Chunked, Vec<Diagnostic>)> {
    if !(eps > 0.0 && eps < 1.0) {
        return Err(SvyError::InvalidArgument(format!(
            "probability floor must lie in (0, 1), got {}",
            eps
        )));
    }

    let mut clamped = 0usize;
    let values: Vec<Option<f64>> = observed
        .into_iter()
        .zip(inclusion_prob.into_iter())
        .map(|(obs, p)| {
            let (obs, p) = (obs?, p?);
            if !p.is_finite() {
                clamped += 1;
                return None;
            }
            let p_used = if p <= 0.0 || p > 1.0 {
                clamped += 1;
                p.clamp(eps, 1.0)
            } else if p < eps {
                clamped += 1;
                eps
            } else {
                p
            };
            Some(obs / p_used)
        })
        .collect();

    let mut diagnostics = Vec::new();
    if clamped > 0 {
        diagnostics.push(Diagnostic::warning(
            DiagnosticCode::ClampedProbability,
            format!(
                "{} inclusion probabilit(ies) outside ({}, 1] were clamped",
                clamped, eps
            ),
            clamped,
        ));
    }
    Ok((
        Float64Chunked::from_slice_options("ht_response".into(), &values),
        diagnostics,
    ))
}

// ============================================================================
// Species/category aggregation
// ============================================================================

/// Sum several category columns (e.g. per-species catch) within each
/// sampling unit, BEFORE ratio or HT estimation.
///
/// Summing after estimating each category separately ignores the
/// within-unit covariance between categories and produces a wrong
/// variance for the aggregate; callers must aggregate here first. A null
/// category value on a unit contributes zero. Requesting only columns
/// absent from the frame is an error; a partially-absent request carries
/// a warning diagnostic.
pub fn sum_category_columns(
    frame: &DataFrame,
    categories: &[&str],
) -> Result<(Float64Chunked, Vec<Diagnostic>)> {
    if categories.is_empty() {
        return Err(SvyError::Estimand {
            column: "<categories>".into(),
            detail: "no category columns requested".into(),
        });
    }

    let mut present: Vec<&Float64Chunked> = Vec::new();
    let mut missing: Vec<&str> = Vec::new();
    for &name in categories {
        match frame.column(name) {
            Ok(col) => present.push(col.f64()?),
            Err(_) => missing.push(name),
        }
    }
    if present.is_empty() {
        return Err(SvyError::Estimand {
            column: categories.join(", "),
            detail: "none of the requested category columns exist in the data".into(),
        });
    }

    let n = frame.height();
    let mut sums = vec![0.0f64; n];
    for col in &present {
        for (i, v) in col.into_iter().enumerate() {
            sums[i] += v.unwrap_or(0.0);
        }
    }
    let values: Vec<Option<f64>> = sums.into_iter().map(Some).collect();

    let mut diagnostics = Vec::new();
    if !missing.is_empty() {
        diagnostics.push(Diagnostic::warning(
            DiagnosticCode::MissingCategories,
            format!(
                "requested categor(ies) absent everywhere: {}",
                missing.join(", ")
            ),
            missing.len(),
        ));
    }
    Ok((
        Float64Chunked::from_slice_options("category_total".into(), &values),
        diagnostics,
    ))
}

// ============================================================================
// Day-level (PSU) collapse
// ============================================================================

/// Collapse per-interview HT contributions to one record per primary
/// sampling unit (per stratum and group tuple), carrying the weighted sum
/// `sum(w*y)` as the PSU's response under unit weight.
///
/// Count-based effort estimators must hand the variance engine day-level
/// records: computing variance on the ungrouped per-interview rows when
/// the actual PSU is the day misstates clustering. Requiring this
/// collapse makes that mistake structurally impossible.
pub fn collapse_to_psu(
    design: &SamplingDesign,
    response_col: &str,
    group_cols: &[String],
) -> Result<(SamplingDesign, Vec<Diagnostic>)> {
    let Some(psu_col) = design.psu_col() else {
        return Err(SvyError::InvalidArgument(
            "PSU collapse requires a design with a declared PSU column".into(),
        ));
    };
    let psu_col = psu_col.to_string();

    let frame = design.frame();
    let y = frame.column(response_col)?.f64()?;
    let w = design.weights()?;
    let psus = design
        .psus()?
        .ok_or_else(|| SvyError::InvalidArgument("PSU column unreadable".into()))?;
    let strata = design.strata()?;
    let fpc = design.fpc()?;
    let groups: Vec<&StringChunked> = group_cols
        .iter()
        .map(|c| frame.column(c).and_then(|s| s.str()))
        .collect::<PolarsResult<_>>()?;

    #[derive(Hash, PartialEq, Eq)]
    struct Key {
        stratum: Option<String>,
        psu: String,
        group: Vec<String>,
    }

    let mut order: Vec<Key> = Vec::new();
    let mut sums: HashMap<usize, (f64, Option<f64>)> = HashMap::new();
    let mut index: HashMap<Key, usize> = HashMap::new();
    let mut excluded = 0usize;

    for i in 0..design.n() {
        let (Some(yi), Some(wi), Some(pi)) = (y.get(i), w.get(i), psus.get(i)) else {
            excluded += 1;
            continue;
        };
        if !yi.is_finite() || !wi.is_finite() || wi <= 0.0 {
            excluded += 1;
            continue;
        }
        let mut group = Vec::with_capacity(groups.len());
        let mut null_group = false;
        for g in &groups {
            match g.get(i) {
                Some(v) => group.push(v.to_string()),
                None => {
                    null_group = true;
                    break;
                }
            }
        }
        if null_group {
            excluded += 1;
            continue;
        }

        let key = Key {
            stratum: strata.and_then(|s| s.get(i)).map(str::to_string),
            psu: pi.to_string(),
            group,
        };
        let idx = match index.get(&key) {
            Some(&idx) => idx,
            None => {
                let idx = order.len();
                order.push(Key {
                    stratum: key.stratum.clone(),
                    psu: key.psu.clone(),
                    group: key.group.clone(),
                });
                index.insert(key, idx);
                idx
            }
        };
        let entry = sums.entry(idx).or_insert((0.0, None));
        entry.0 += wi * yi;
        if entry.1.is_none() {
            entry.1 = fpc.and_then(|f| f.get(i));
        }
    }

    if order.is_empty() {
        return Err(SvyError::Estimand {
            column: response_col.to_string(),
            detail: "no usable rows to collapse".into(),
        });
    }

    let m = order.len();
    let mut columns: Vec<Series> = Vec::new();
    if let Some(stratum_col) = design.stratum_col() {
        let vals: Vec<Option<String>> = order.iter().map(|k| k.stratum.clone()).collect();
        columns.push(Series::new(stratum_col.into(), vals));
    }
    let psu_vals: Vec<String> = order.iter().map(|k| k.psu.clone()).collect();
    columns.push(Series::new(psu_col.as_str().into(), psu_vals));
    for (gi, g) in group_cols.iter().enumerate() {
        let vals: Vec<String> = order.iter().map(|k| k.group[gi].clone()).collect();
        columns.push(Series::new(g.as_str().into(), vals));
    }
    let totals: Vec<f64> = (0..m).map(|i| sums[&i].0).collect();
    columns.push(Series::new(response_col.into(), totals));
    columns.push(Series::new(design.weight_col().into(), vec![1.0f64; m]));
    if let Some(fpc_col) = design.fpc_col() {
        let vals: Vec<Option<f64>> = (0..m).map(|i| sums[&i].1).collect();
        columns.push(Series::new(fpc_col.into(), vals));
    }

    let data = DataFrame::new(columns)?;
    let mut collapsed = SamplingDesign::new(data, design.weight_col()).with_psu(psu_col);
    if let Some(s) = design.stratum_col() {
        collapsed = collapsed.with_strata(s);
    }
    if let Some(f) = design.fpc_col() {
        collapsed = collapsed.with_fpc(f);
    }

    let mut diagnostics = Vec::new();
    if excluded > 0 {
        diagnostics.push(Diagnostic::warning(
            DiagnosticCode::ExcludedUnits,
            format!("{} row(s) excluded during PSU collapse", excluded),
            excluded,
        ));
    }
    Ok((collapsed, diagnostics))
}

// ============================================================================
// Survey-method family
// ============================================================================

/// The creel count instruments, as one closed family dispatched by a
/// single `match` when building the per-unit effort response.
///
/// Every variant names a count column and an inclusion-probability
/// column; instantaneous-style instruments additionally expand the
/// snapshot count by the day length, and bus-route counts by the
/// reciprocal of the observable wait fraction.
#[derive(Debug, Clone)]
pub enum SurveyMethod {
    /// Completed-trip counts collected at an access point.
    Access { count: String, prob: String },
    /// Progressive (roving) instantaneous counts.
    Roving {
        count: String,
        prob: String,
        day_length: String,
    },
    /// Bus-route circuits: a party is observable only for a fraction of
    /// the circuit wait.
    BusRoute {
        count: String,
        prob: String,
        wait_fraction: String,
    },
    /// Aerial snapshot counts.
    Aerial {
        count: String,
        prob: String,
        day_length: String,
    },
    /// Single instantaneous ground counts.
    Instantaneous {
        count: String,
        prob: String,
        day_length: String,
    },
}

impl SurveyMethod {
    /// Build the per-unit Horvitz–Thompson effort response for this
    /// instrument over the design's frame.
    pub fn response(
        &self,
        frame: &DataFrame,
        eps: f64,
    ) -> Result<(Float64Chunked, Vec<Diagnostic>)> {
        let (count_col, prob_col) = match self {
            SurveyMethod::Access { count, prob }
            | SurveyMethod::Roving { count, prob, .. }
            | SurveyMethod::BusRoute { count, prob, .. }
            | SurveyMethod::Aerial { count, prob, .. }
            | SurveyMethod::Instantaneous { count, prob, .. } => (count, prob),
        };
        let counts = frame.column(count_col)?.f64()?;
        let probs = frame.column(prob_col)?.f64()?;

        let mut invalid_factor = 0usize;
        let expanded: Vec<Option<f64>> = match self {
            SurveyMethod::Access { .. } => counts.into_iter().collect(),
            SurveyMethod::Roving { day_length, .. }
            | SurveyMethod::Aerial { day_length, .. }
            | SurveyMethod::Instantaneous { day_length, .. } => {
                let hours = frame.column(day_length)?.f64()?;
                counts
                    .into_iter()
                    .zip(hours.into_iter())
                    .map(|(c, h)| match (c, h) {
                        (Some(c), Some(h)) if h.is_finite() && h > 0.0 => Some(c * h),
                        (Some(_), _) => {
                            invalid_factor += 1;
                            None
                        }
                        _ => None,
                    })
                    .collect()
            }
            SurveyMethod::BusRoute { wait_fraction, .. } => {
                let fracs = frame.column(wait_fraction)?.f64()?;
                counts
                    .into_iter()
                    .zip(fracs.into_iter())
                    .map(|(c, f)| match (c, f) {
                        (Some(c), Some(f)) if f.is_finite() && f > 0.0 && f <= 1.0 => {
                            Some(c / f)
                        }
                        (Some(_), _) => {
                            invalid_factor += 1;
                            None
                        }
                        _ => None,
                    })
                    .collect()
            }
        };

        let expanded = Float64Chunked::from_slice_options("effort_count".into(), &expanded);
        let (response, mut diagnostics) = ht_response(&expanded, probs, eps)?;
        if invalid_factor > 0 {
            diagnostics.push(Diagnostic::warning(
                DiagnosticCode::ExcludedUnits,
                format!(
                    "{} count(s) dropped for a missing or out-of-range expansion factor",
                    invalid_factor
                ),
                invalid_factor,
            ));
        }
        Ok((response, diagnostics))
    }
}
