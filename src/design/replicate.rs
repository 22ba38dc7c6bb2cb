// src/design/replicate.rs
//! Replicate-weight construction: stratified PSU bootstrap and
//! delete-one-PSU jackknife.
//!
//! Both builders operate on a validated design whose units are the rows
//! the engine will actually estimate over (invalid units already
//! excluded). Rows without a PSU label are treated as their own PSU; rows
//! without a stratum label share a single implicit stratum.

use ndarray::Array2;
use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use std::collections::HashMap;

use crate::design::sampling::{RepWeightKind, ReplicateWeights, SamplingDesign};
use crate::error::{Result, SvyError};

/// Fewest PSUs a stratum may hold for with-replacement resampling to say
/// anything about between-PSU variability.
pub const MIN_BOOTSTRAP_PSUS: usize = 3;

/// Row-to-PSU assignment shared by both builders.
struct PsuLayout {
    /// Per-row global PSU index.
    psu_of_row: Vec<u32>,
    /// Per-row stratum index.
    stratum_of_row: Vec<u32>,
    /// Global PSU indices grouped by stratum, in first-appearance order.
    psus_by_stratum: Vec<Vec<u32>>,
}

fn psu_layout(design: &SamplingDesign) -> Result<PsuLayout> {
    let n = design.n();
    let strata = design.strata()?;
    let psus = design.psus()?;

    let mut stratum_ids: HashMap<String, u32> = HashMap::new();
    let mut psu_ids: HashMap<(u32, String), u32> = HashMap::new();
    let mut stratum_of_row = Vec::with_capacity(n);
    let mut psu_of_row = Vec::with_capacity(n);
    let mut psus_by_stratum: Vec<Vec<u32>> = Vec::new();
    let mut next_psu = 0u32;

    for i in 0..n {
        let s_key = strata
            .and_then(|c| c.get(i))
            .unwrap_or("")
            .to_string();
        let next_stratum = stratum_ids.len() as u32;
        let s_id = *stratum_ids.entry(s_key).or_insert(next_stratum);
        if s_id as usize == psus_by_stratum.len() {
            psus_by_stratum.push(Vec::new());
        }

        // A missing PSU label makes the row its own PSU.
        let p_key = match psus.and_then(|c| c.get(i)) {
            Some(p) => p.to_string(),
            None => format!("\u{1}row{}", i),
        };
        let p_id = *psu_ids.entry((s_id, p_key)).or_insert_with(|| {
            let id = next_psu;
            next_psu += 1;
            psus_by_stratum[s_id as usize].push(id);
            id
        });

        stratum_of_row.push(s_id);
        psu_of_row.push(p_id);
    }

    Ok(PsuLayout {
        psu_of_row,
        stratum_of_row,
        psus_by_stratum,
    })
}

/// Build bootstrap replicate weights by resampling PSUs within stratum
/// with replacement, `n_replicates` times.
///
/// Each replicate draws `n_h` PSUs (with replacement) in every stratum
/// `h` and multiplies a unit's weight by the number of times its PSU was
/// drawn. The variance convention is the sample variance of the
/// per-replicate estimates: `scale = 1/(R-1)`, unit `rscales`.
pub fn bootstrap_weights(
    design: &SamplingDesign,
    n_replicates: usize,
    seed: u64,
) -> Result<ReplicateWeights> {
    if n_replicates < 2 {
        return Err(SvyError::InvalidArgument(
            "bootstrap requires at least 2 replicates".into(),
        ));
    }
    let layout = psu_layout(design)?;
    for (h, psus) in layout.psus_by_stratum.iter().enumerate() {
        if psus.len() < MIN_BOOTSTRAP_PSUS {
            return Err(SvyError::MethodUnavailable {
                requested: "bootstrap".into(),
                reason: format!(
                    "stratum {} has {} PSU(s); resampling needs at least {}",
                    h,
                    psus.len(),
                    MIN_BOOTSTRAP_PSUS
                ),
            });
        }
    }

    let n = design.n();
    let base = design.base_weights()?;

    let columns: Vec<Vec<f64>> = (0..n_replicates)
        .into_par_iter()
        .map(|r| {
            let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed.wrapping_add(r as u64));
            // Resample counts per global PSU id.
            let mut counts: HashMap<u32, u32> = HashMap::new();
            for psus in &layout.psus_by_stratum {
                for _ in 0..psus.len() {
                    let drawn = psus[rng.gen_range(0..psus.len())];
                    *counts.entry(drawn).or_insert(0) += 1;
                }
            }
            (0..n)
                .map(|i| {
                    let c = counts.get(&layout.psu_of_row[i]).copied().unwrap_or(0);
                    base[i] * c as f64
                })
                .collect()
        })
        .collect();

    Ok(ReplicateWeights {
        matrix: columns_to_matrix(n, &columns),
        kind: RepWeightKind::Bootstrap,
        scale: 1.0 / (n_replicates as f64 - 1.0),
        rscales: vec![1.0; n_replicates],
    })
}

/// Build delete-one-PSU jackknife replicate weights.
///
/// One replicate per deletable PSU: the deleted PSU's units get weight
/// zero and the remaining units of its stratum are scaled by
/// `n_h / (n_h - 1)`. Lonely PSUs (stratum with a single PSU) cannot be
/// deleted and produce no replicate. Variance convention per replicate:
/// `rscales[r] = (R-1)/R`, `scale = 1`.
pub fn jackknife_weights(design: &SamplingDesign) -> Result<ReplicateWeights> {
    let layout = psu_layout(design)?;

    // (deleted psu, its stratum, n_h of that stratum)
    let mut deletions: Vec<(u32, u32, usize)> = Vec::new();
    for (h, psus) in layout.psus_by_stratum.iter().enumerate() {
        if psus.len() < 2 {
            continue;
        }
        for &p in psus {
            deletions.push((p, h as u32, psus.len()));
        }
    }
    let n_replicates = deletions.len();
    if n_replicates < 2 {
        return Err(SvyError::MethodUnavailable {
            requested: "jackknife".into(),
            reason: "fewer than 2 deletable PSUs in the design".into(),
        });
    }

    let n = design.n();
    let base = design.base_weights()?;

    let columns: Vec<Vec<f64>> = deletions
        .par_iter()
        .map(|&(deleted, stratum, n_h)| {
            let adj = n_h as f64 / (n_h as f64 - 1.0);
            (0..n)
                .map(|i| {
                    if layout.psu_of_row[i] == deleted {
                        0.0
                    } else if layout.stratum_of_row[i] == stratum {
                        base[i] * adj
                    } else {
                        base[i]
                    }
                })
                .collect()
        })
        .collect();

    let r = n_replicates as f64;
    Ok(ReplicateWeights {
        matrix: columns_to_matrix(n, &columns),
        kind: RepWeightKind::Jackknife,
        scale: 1.0,
        rscales: vec![(r - 1.0) / r; n_replicates],
    })
}

fn columns_to_matrix(n: usize, columns: &[Vec<f64>]) -> Array2<f64> {
    let mut matrix = Array2::zeros((n, columns.len()));
    for (r, col) in columns.iter().enumerate() {
        for (i, &v) in col.iter().enumerate() {
            matrix[[i, r]] = v;
        }
    }
    matrix
}
