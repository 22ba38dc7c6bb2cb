// src/estimation/taylor.rs
//! First-order Taylor (linearization) variance for totals, ratios and
//! weighted means under stratified-cluster sampling, plus the matching
//! simple-random-sample variances used for design effects.
//!
//! All functions operate on dense slices; the engine extracts and cleans
//! columns (excluding units with missing responses or weights, with a
//! diagnostic count) before calling in here.

use polars::prelude::*;
use std::collections::HashMap;

/// Policy for strata holding a single PSU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LonelyPsuRule {
    /// Contribute the squared deviation of the lonely PSU's score total
    /// from the grand mean of all PSU totals (a conservative adjustment,
    /// the default).
    #[default]
    Center,
    /// Contribute zero variance for the lonely stratum.
    Zero,
}

/// Map a categorical column to dense indices `0..k` in first-appearance
/// order. Nulls map to `u32::MAX` and are skipped downstream.
pub(crate) fn index_categorical(col: &StringChunked) -> (Vec<u32>, u32) {
    let mut map: HashMap<&str, u32> = HashMap::new();
    let mut next = 0u32;
    let indices = col
        .into_iter()
        .map(|opt| match opt {
            Some(s) => *map.entry(s).or_insert_with(|| {
                let i = next;
                next += 1;
                i
            }),
            None => u32::MAX,
        })
        .collect();
    (indices, next)
}

// ============================================================================
// Point estimates
// ============================================================================

pub fn point_estimate_total(y: &[f64], w: &[f64]) -> f64 {
    y.iter().zip(w.iter()).map(|(yi, wi)| yi * wi).sum()
}

/// Ratio-of-means point estimate; NaN when the weighted denominator sum
/// is zero (the engine turns that into a group-level failure).
pub fn point_estimate_ratio(y: &[f64], x: &[f64], w: &[f64]) -> f64 {
    let sum_wy: f64 = y.iter().zip(w.iter()).map(|(yi, wi)| yi * wi).sum();
    let sum_wx: f64 = x.iter().zip(w.iter()).map(|(xi, wi)| xi * wi).sum();
    if sum_wx == 0.0 {
        f64::NAN
    } else {
        sum_wy / sum_wx
    }
}

/// Weighted mean; used for the mean-of-ratios estimator where `z` holds
/// per-unit ratios.
pub fn point_estimate_mean(z: &[f64], w: &[f64]) -> f64 {
    let sum_w: f64 = w.iter().sum();
    if sum_w == 0.0 {
        return f64::NAN;
    }
    z.iter().zip(w.iter()).map(|(zi, wi)| zi * wi).sum::<f64>() / sum_w
}

// ============================================================================
// Linearization scores
// ============================================================================

pub fn scores_total(y: &[f64], w: &[f64]) -> Vec<f64> {
    y.iter().zip(w.iter()).map(|(yi, wi)| wi * yi).collect()
}

pub fn scores_ratio(y: &[f64], x: &[f64], w: &[f64]) -> Vec<f64> {
    let r_hat = point_estimate_ratio(y, x, w);
    let sum_wx: f64 = x.iter().zip(w.iter()).map(|(xi, wi)| xi * wi).sum();
    if sum_wx == 0.0 || !r_hat.is_finite() {
        return vec![0.0; y.len()];
    }
    y.iter()
        .zip(x.iter())
        .zip(w.iter())
        .map(|((yi, xi), wi)| (wi / sum_wx) * (yi - r_hat * xi))
        .collect()
}

pub fn scores_mean(z: &[f64], w: &[f64]) -> Vec<f64> {
    let est = point_estimate_mean(z, w);
    let sum_w: f64 = w.iter().sum();
    if sum_w == 0.0 || !est.is_finite() {
        return vec![0.0; z.len()];
    }
    z.iter()
        .zip(w.iter())
        .map(|(zi, wi)| (wi / sum_w) * (zi - est))
        .collect()
}

// ============================================================================
// Design variance
// ============================================================================

/// Linearization variance of a score sum under stratified-cluster
/// sampling.
///
/// Scores are first collapsed to per-PSU totals (per stratum when strata
/// are present); each stratum then contributes
/// `m_h/(m_h-1) * sum((t - t_bar_h)^2)`, scaled by a per-stratum
/// finite-population factor `1 - m_h/N_h` when population sizes are
/// supplied. Strata with a single PSU follow `lonely`; the returned flag
/// reports whether that adjustment fired.
pub fn taylor_variance(
    scores: &[f64],
    strata: Option<&[u32]>,
    psu: Option<&[u32]>,
    lonely: LonelyPsuRule,
    fpc: Option<&[f64]>,
) -> (f64, bool) {
    let n = scores.len();
    if n == 0 {
        return (0.0, false);
    }

    // Collapse scores to per-(stratum, PSU) totals. Without a PSU column
    // each unit is its own PSU; without strata there is one stratum.
    let mut totals: HashMap<(u32, u32), f64> = HashMap::new();
    let mut stratum_fpc: HashMap<u32, f64> = HashMap::new();
    for i in 0..n {
        let h = strata.map_or(0, |s| s[i]);
        let p = psu.map_or(i as u32, |p| p[i]);
        if h == u32::MAX || p == u32::MAX {
            continue;
        }
        *totals.entry((h, p)).or_insert(0.0) += scores[i];
        if let Some(f) = fpc {
            stratum_fpc.entry(h).or_insert(f[i]);
        }
    }
    if totals.is_empty() {
        return (0.0, false);
    }

    let mut by_stratum: HashMap<u32, Vec<f64>> = HashMap::new();
    for (&(h, _), &t) in &totals {
        by_stratum.entry(h).or_default().push(t);
    }

    let grand_mean = totals.values().sum::<f64>() / totals.len() as f64;

    let mut variance = 0.0;
    let mut lonely_applied = false;
    for (h, psu_totals) in &by_stratum {
        let m_h = psu_totals.len();
        let factor = fpc_factor(m_h, stratum_fpc.get(h).copied());
        if m_h == 1 {
            lonely_applied = true;
            if lonely == LonelyPsuRule::Center {
                variance += factor * (psu_totals[0] - grand_mean).powi(2);
            }
            continue;
        }
        let mean_h = psu_totals.iter().sum::<f64>() / m_h as f64;
        let ss: f64 = psu_totals.iter().map(|t| (t - mean_h).powi(2)).sum();
        variance += factor * (m_h as f64 / (m_h as f64 - 1.0)) * ss;
    }
    (variance, lonely_applied)
}

/// Per-stratum finite population factor `1 - m/N`, ignored when the
/// population size is missing or implausible.
fn fpc_factor(m: usize, population: Option<f64>) -> f64 {
    match population {
        Some(n_pop) if n_pop.is_finite() && n_pop >= m as f64 && n_pop > 0.0 => {
            (1.0 - m as f64 / n_pop).clamp(0.0, 1.0)
        }
        _ => 1.0,
    }
}

/// Design degrees of freedom: `sum_h (m_h - 1)` over strata, where `m_h`
/// counts PSUs (units when no PSU column is declared).
pub fn degrees_of_freedom(n: usize, strata: Option<&[u32]>, psu: Option<&[u32]>) -> usize {
    let mut psus_per_stratum: HashMap<u32, std::collections::HashSet<u32>> = HashMap::new();
    for i in 0..n {
        let h = strata.map_or(0, |s| s[i]);
        let p = psu.map_or(i as u32, |p| p[i]);
        if h == u32::MAX || p == u32::MAX {
            continue;
        }
        psus_per_stratum.entry(h).or_default().insert(p);
    }
    psus_per_stratum
        .values()
        .map(|psus| psus.len().saturating_sub(1))
        .sum()
}

// ============================================================================
// SRS-equivalent variance (design-effect denominator)
// ============================================================================

fn weighted_s2(y: &[f64], wn: &[f64]) -> f64 {
    let n = y.len() as f64;
    if n <= 1.0 {
        return f64::NAN;
    }
    let mu: f64 = y.iter().zip(wn.iter()).map(|(yi, wi)| wi * yi).sum();
    let ss: f64 = y
        .iter()
        .zip(wn.iter())
        .map(|(yi, wi)| wi * (yi - mu).powi(2))
        .sum();
    (n / (n - 1.0)) * ss
}

/// `1 - n/N_hat` with `N_hat = sum_w`, or 1 for self-weighting designs
/// where the estimated population is not larger than the sample.
fn srs_fpc(n: f64, sum_w: f64) -> f64 {
    let f = 1.0 - n / sum_w;
    if f > 0.0 {
        f
    } else {
        1.0
    }
}

pub fn srs_variance_total(y: &[f64], w: &[f64]) -> f64 {
    let n = y.len() as f64;
    if n < 2.0 {
        return f64::NAN;
    }
    let sum_w: f64 = w.iter().sum();
    if sum_w <= 0.0 {
        return f64::NAN;
    }
    let wn: Vec<f64> = w.iter().map(|wi| wi / sum_w).collect();
    let s2 = weighted_s2(y, &wn);
    (sum_w.powi(2) / n) * s2 * srs_fpc(n, sum_w)
}

pub fn srs_variance_ratio(y: &[f64], x: &[f64], w: &[f64]) -> f64 {
    let n = y.len() as f64;
    if n < 2.0 {
        return f64::NAN;
    }
    let sum_w: f64 = w.iter().sum();
    if sum_w <= 0.0 {
        return f64::NAN;
    }
    let wn: Vec<f64> = w.iter().map(|wi| wi / sum_w).collect();
    let ybar: f64 = y.iter().zip(wn.iter()).map(|(yi, wi)| wi * yi).sum();
    let xbar: f64 = x.iter().zip(wn.iter()).map(|(xi, wi)| wi * xi).sum();
    if xbar == 0.0 {
        return f64::NAN;
    }
    let rhat = ybar / xbar;
    let resid: Vec<f64> = y
        .iter()
        .zip(x.iter())
        .map(|(yi, xi)| yi - rhat * xi)
        .collect();
    let s2 = weighted_s2(&resid, &wn);
    (s2 / (n * xbar.powi(2))) * srs_fpc(n, sum_w)
}

pub fn srs_variance_mean(z: &[f64], w: &[f64]) -> f64 {
    let n = z.len() as f64;
    if n < 2.0 {
        return f64::NAN;
    }
    let sum_w: f64 = w.iter().sum();
    if sum_w <= 0.0 {
        return f64::NAN;
    }
    let wn: Vec<f64> = w.iter().map(|wi| wi / sum_w).collect();
    let s2 = weighted_s2(z, &wn);
    (s2 / n) * srs_fpc(n, sum_w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const Y10: [f64; 10] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];

    #[test]
    fn test_ht_total_reference_scenario() {
        // 10 units, unit weight, response 1..10: total 55, variance
        // n/(n-1) * sum((y - ybar)^2) = (10/9) * 82.5.
        let w = [1.0; 10];
        assert_relative_eq!(point_estimate_total(&Y10, &w), 55.0);
        let scores = scores_total(&Y10, &w);
        let (var, lonely) = taylor_variance(&scores, None, None, LonelyPsuRule::Center, None);
        assert!(!lonely);
        assert_relative_eq!(var, 10.0 / 9.0 * 82.5, epsilon = 1e-10);
    }

    #[test]
    fn test_mean_matches_srs_formula() {
        // Unweighted, unstratified, unclustered linearization variance of
        // a mean must equal s^2 / n.
        let w = [1.0; 10];
        let scores = scores_mean(&Y10, &w);
        let (var, _) = taylor_variance(&scores, None, None, LonelyPsuRule::Center, None);
        let mean = 5.5;
        let s2: f64 = Y10.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / 9.0;
        assert_relative_eq!(var, s2 / 10.0, epsilon = 1e-10);
    }

    #[test]
    fn test_ratio_with_unit_denominator_is_mean() {
        let w = [1.0; 10];
        let x = [1.0; 10];
        assert_relative_eq!(point_estimate_ratio(&Y10, &x, &w), 5.5);
        let r_scores = scores_ratio(&Y10, &x, &w);
        let m_scores = scores_mean(&Y10, &w);
        for (a, b) in r_scores.iter().zip(m_scores.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_stratified_variance() {
        let y = [1.0, 2.0, 3.0, 4.0];
        let w = [1.0; 4];
        let strata = [0u32, 0, 1, 1];
        let scores = scores_total(&y, &w);
        let (var, lonely) =
            taylor_variance(&scores, Some(&strata), None, LonelyPsuRule::Center, None);
        assert!(!lonely);
        // Each stratum: 2/1 * (0.5^2 + 0.5^2) = 1.
        assert_relative_eq!(var, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_clustering_collapses_to_psu_totals() {
        // Two units per day; variance must act on day totals, not units.
        let y = [1.0, 2.0, 3.0, 4.0];
        let w = [1.0; 4];
        let psu = [0u32, 0, 1, 1];
        let scores = scores_total(&y, &w);
        let (var, _) = taylor_variance(&scores, None, Some(&psu), LonelyPsuRule::Center, None);
        // Day totals 3 and 7: 2/1 * (2^2 + 2^2) = 16.
        assert_relative_eq!(var, 16.0, epsilon = 1e-12);
    }

    #[test]
    fn test_lonely_psu_center_rule() {
        let y = [2.0, 6.0];
        let w = [1.0; 2];
        let strata = [0u32, 1];
        let scores = scores_total(&y, &w);
        let (var, lonely) =
            taylor_variance(&scores, Some(&strata), None, LonelyPsuRule::Center, None);
        assert!(lonely);
        // Grand mean 4: (2-4)^2 + (6-4)^2 = 8.
        assert_relative_eq!(var, 8.0, epsilon = 1e-12);

        let (var_zero, lonely_zero) =
            taylor_variance(&scores, Some(&strata), None, LonelyPsuRule::Zero, None);
        assert!(lonely_zero);
        assert_relative_eq!(var_zero, 0.0);
    }

    #[test]
    fn test_fpc_shrinks_variance() {
        let w = [1.0; 10];
        let scores = scores_total(&Y10, &w);
        let fpc = [20.0; 10];
        let (var_fpc, _) =
            taylor_variance(&scores, None, None, LonelyPsuRule::Center, Some(&fpc));
        let (var, _) = taylor_variance(&scores, None, None, LonelyPsuRule::Center, None);
        assert_relative_eq!(var_fpc, 0.5 * var, epsilon = 1e-10);
    }

    #[test]
    fn test_degrees_of_freedom() {
        assert_eq!(degrees_of_freedom(10, None, None), 9);
        let strata = [0u32, 0, 1, 1];
        assert_eq!(degrees_of_freedom(4, Some(&strata), None), 2);
        let psu = [0u32, 0, 1, 1];
        assert_eq!(degrees_of_freedom(4, None, Some(&psu)), 1);
    }

    #[test]
    fn test_srs_total_self_weighting_skips_degenerate_fpc() {
        // With all weights 1 the estimated population equals n and the
        // (1 - n/N_hat) term would zero the variance; it is skipped.
        let w = [1.0; 10];
        let v = srs_variance_total(&Y10, &w);
        let s2 = 82.5 / 9.0;
        assert_relative_eq!(v, 100.0 * s2 / 10.0, epsilon = 1e-10);
    }

    #[test]
    fn test_index_categorical() {
        let col = StringChunked::from_slice("g".into(), &["b", "a", "b", "c"]);
        let (idx, k) = index_categorical(&col);
        assert_eq!(idx, vec![0, 1, 0, 2]);
        assert_eq!(k, 3);
    }
}
