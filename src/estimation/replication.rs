// src/estimation/replication.rs
//! Replication-based variance: per-replicate point estimation and the
//! rule that turns replicate deviations into a variance.

use rayon::prelude::*;

use crate::design::sampling::ReplicateWeights;

/// Evaluate a point estimator once per replicate weighting.
///
/// `estimator` receives one full column of replicate weights and returns
/// the point estimate under that weighting; the replicate estimates are
/// independent, so the fan-out is parallel.
pub fn replicate_estimates<F>(replicates: &ReplicateWeights, estimator: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64 + Sync,
{
    (0..replicates.n_replicates())
        .into_par_iter()
        .map(|r| {
            let weights = replicates.column(r);
            estimator(&weights)
        })
        .collect()
}

/// Combine per-replicate estimates into a variance:
/// `scale * sum_r rscales[r] * (theta_r - theta_bar)^2`, where
/// `theta_bar` is the mean over finite replicate estimates.
///
/// Non-finite replicate estimates (e.g. a bootstrap draw that emptied a
/// ratio denominator) are skipped; the second return value counts them so
/// the engine can surface the skip.
pub fn variance_from_replicates(
    theta_reps: &[f64],
    scale: f64,
    rscales: &[f64],
) -> (f64, usize) {
    let finite: Vec<(f64, f64)> = theta_reps
        .iter()
        .zip(rscales.iter())
        .filter(|(t, _)| t.is_finite())
        .map(|(&t, &c)| (t, c))
        .collect();
    let skipped = theta_reps.len() - finite.len();
    if finite.len() < 2 {
        return (f64::NAN, skipped);
    }

    let mean = finite.iter().map(|(t, _)| t).sum::<f64>() / finite.len() as f64;
    let var = scale
        * finite
            .iter()
            .map(|(t, c)| c * (t - mean).powi(2))
            .sum::<f64>();
    (var, skipped)
}
