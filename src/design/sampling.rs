// src/design/sampling.rs
//! Immutable description of a stratified, clustered finite-population
//! sampling design over a per-unit data frame.

use ndarray::{Array2, Axis};
use polars::prelude::*;
use std::collections::HashMap;

use crate::error::{Result, SvyError};

/// How a replicate-weight matrix was built, which determines how
/// per-replicate deviations are combined into a variance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepWeightKind {
    Bootstrap,
    Jackknife,
}

/// An n × R matrix of alternative full-sample weightings.
///
/// `variance = scale * sum_r rscales[r] * (theta_r - center)^2`
#[derive(Debug, Clone)]
pub struct ReplicateWeights {
    pub matrix: Array2<f64>,
    pub kind: RepWeightKind,
    pub scale: f64,
    pub rscales: Vec<f64>,
}

impl ReplicateWeights {
    pub fn n_replicates(&self) -> usize {
        self.matrix.ncols()
    }

    /// Extract replicate column `r` as a plain vector.
    pub fn column(&self, r: usize) -> Vec<f64> {
        self.matrix.column(r).to_vec()
    }
}

/// A finite-population sampling design: per-unit inclusion weights with
/// optional stratum, primary-sampling-unit (cluster) and finite-population
/// correction columns, plus an optional replicate-weight matrix.
///
/// The design wraps an owned [`DataFrame`] and refers to columns by name.
/// It is treated as immutable: reweighting derives a new design via
/// [`SamplingDesign::derive_with_weights`], and restriction to a subset of
/// units goes through [`SamplingDesign::subset`], the only code path that
/// realigns the replicate matrix with the frame rows.
#[derive(Debug, Clone)]
pub struct SamplingDesign {
    data: DataFrame,
    weight: String,
    stratum: Option<String>,
    psu: Option<String>,
    fpc: Option<String>,
    replicates: Option<ReplicateWeights>,
}

impl SamplingDesign {
    pub fn new(data: DataFrame, weight: impl Into<String>) -> Self {
        Self {
            data,
            weight: weight.into(),
            stratum: None,
            psu: None,
            fpc: None,
            replicates: None,
        }
    }

    pub fn with_strata(mut self, col: impl Into<String>) -> Self {
        self.stratum = Some(col.into());
        self
    }

    pub fn with_psu(mut self, col: impl Into<String>) -> Self {
        self.psu = Some(col.into());
        self
    }

    pub fn with_fpc(mut self, col: impl Into<String>) -> Self {
        self.fpc = Some(col.into());
        self
    }

    pub fn with_replicates(mut self, replicates: ReplicateWeights) -> Self {
        self.replicates = Some(replicates);
        self
    }

    pub fn n(&self) -> usize {
        self.data.height()
    }

    pub fn frame(&self) -> &DataFrame {
        &self.data
    }

    pub fn weight_col(&self) -> &str {
        &self.weight
    }

    pub fn stratum_col(&self) -> Option<&str> {
        self.stratum.as_deref()
    }

    pub fn psu_col(&self) -> Option<&str> {
        self.psu.as_deref()
    }

    pub fn fpc_col(&self) -> Option<&str> {
        self.fpc.as_deref()
    }

    pub fn replicates(&self) -> Option<&ReplicateWeights> {
        self.replicates.as_ref()
    }

    pub fn weights(&self) -> Result<&Float64Chunked> {
        Ok(self.data.column(&self.weight)?.f64()?)
    }

    pub fn strata(&self) -> Result<Option<&StringChunked>> {
        Ok(self
            .stratum
            .as_deref()
            .map(|col| self.data.column(col).and_then(|s| s.str()))
            .transpose()?)
    }

    pub fn psus(&self) -> Result<Option<&StringChunked>> {
        Ok(self
            .psu
            .as_deref()
            .map(|col| self.data.column(col).and_then(|s| s.str()))
            .transpose()?)
    }

    pub fn fpc(&self) -> Result<Option<&Float64Chunked>> {
        Ok(self
            .fpc
            .as_deref()
            .map(|col| self.data.column(col).and_then(|s| s.f64()))
            .transpose()?)
    }

    /// Fail on any structural invariant violation: non-positive or
    /// non-finite weights, a misaligned replicate matrix, or a PSU label
    /// appearing under more than one stratum.
    ///
    /// Null weights are permitted here; units with a null weight are
    /// excluded (and counted) at estimation time.
    pub fn validate(&self) -> Result<()> {
        let n = self.n();
        let weights = self.weights()?;

        let bad_weights = weights
            .into_iter()
            .filter(|w| matches!(w, Some(x) if !x.is_finite() || *x <= 0.0))
            .count();
        if bad_weights > 0 {
            return Err(SvyError::Design {
                field: self.weight.clone(),
                detail: "inclusion weights must be positive and finite".into(),
                n_affected: bad_weights,
            });
        }

        // Touch the optional columns so a misnamed column fails here,
        // not in the middle of an estimation call.
        self.strata()?;
        self.psus()?;
        self.fpc()?;

        if let Some(rw) = &self.replicates {
            if rw.matrix.nrows() != n {
                return Err(SvyError::Design {
                    field: "replicate_weights".into(),
                    detail: format!(
                        "matrix has {} rows but the design has {} units",
                        rw.matrix.nrows(),
                        n
                    ),
                    n_affected: rw.matrix.nrows().abs_diff(n),
                });
            }
            if rw.rscales.len() != rw.matrix.ncols() {
                return Err(SvyError::Design {
                    field: "replicate_weights".into(),
                    detail: format!(
                        "{} rscale factors for {} replicate columns",
                        rw.rscales.len(),
                        rw.matrix.ncols()
                    ),
                    n_affected: 0,
                });
            }
            let negative = rw.matrix.iter().filter(|v| **v < 0.0).count();
            if negative > 0 {
                return Err(SvyError::Design {
                    field: "replicate_weights".into(),
                    detail: "replicate weights must be non-negative (zero codes a dropped unit)"
                        .into(),
                    n_affected: negative,
                });
            }
        }

        self.check_nesting()?;
        Ok(())
    }

    /// Every PSU label must sit inside exactly one stratum.
    fn check_nesting(&self) -> Result<()> {
        let (Some(strata), Some(psus)) = (self.strata()?, self.psus()?) else {
            return Ok(());
        };

        let mut psu_stratum: HashMap<&str, &str> = HashMap::new();
        let mut crossed = 0usize;
        for (s, p) in strata.into_iter().zip(psus.into_iter()) {
            let (Some(s), Some(p)) = (s, p) else { continue };
            match psu_stratum.get(p) {
                Some(&seen) if seen != s => crossed += 1,
                Some(_) => {}
                None => {
                    psu_stratum.insert(p, s);
                }
            }
        }
        if crossed > 0 {
            return Err(SvyError::Design {
                field: self.psu.clone().unwrap_or_default(),
                detail: "cluster labels must be nested within strata; \
                         found labels appearing under two different strata"
                    .into(),
                n_affected: crossed,
            });
        }
        Ok(())
    }

    /// Restrict the design to units where `mask` is true, keeping the
    /// frame rows and the replicate-weight matrix aligned.
    ///
    /// Several estimators subset to a single stratum or group before
    /// computing a group-local ratio or HT sum; misaligning replicate
    /// columns after subsetting silently corrupts every replicate
    /// variance, so this is the only mutator of alignment.
    pub fn subset(&self, mask: &BooleanChunked) -> Result<SamplingDesign> {
        if mask.len() != self.n() {
            return Err(SvyError::Design {
                field: "subset".into(),
                detail: format!(
                    "mask has {} entries for a design of {} units",
                    mask.len(),
                    self.n()
                ),
                n_affected: mask.len().abs_diff(self.n()),
            });
        }

        let data = self.data.filter(mask)?;
        let replicates = match &self.replicates {
            Some(rw) => {
                let keep: Vec<usize> = mask
                    .into_iter()
                    .enumerate()
                    .filter_map(|(i, m)| if m == Some(true) { Some(i) } else { None })
                    .collect();
                Some(ReplicateWeights {
                    matrix: rw.matrix.select(Axis(0), &keep),
                    kind: rw.kind,
                    scale: rw.scale,
                    rscales: rw.rscales.clone(),
                })
            }
            None => None,
        };

        Ok(SamplingDesign {
            data,
            weight: self.weight.clone(),
            stratum: self.stratum.clone(),
            psu: self.psu.clone(),
            fpc: self.fpc.clone(),
            replicates,
        })
    }

    /// Derive a new design with a replacement weight column, e.g. after an
    /// external post-stratification or calibration step. The replicate
    /// matrix (if any) is dropped: replicates built for the old weights do
    /// not describe the new ones.
    pub fn derive_with_weights(&self, weights: Vec<f64>) -> Result<SamplingDesign> {
        if weights.len() != self.n() {
            return Err(SvyError::Design {
                field: self.weight.clone(),
                detail: format!(
                    "{} replacement weights for a design of {} units",
                    weights.len(),
                    self.n()
                ),
                n_affected: weights.len().abs_diff(self.n()),
            });
        }
        let mut data = self.data.clone();
        data.with_column(Series::new(self.weight.as_str().into(), weights))?;
        Ok(SamplingDesign {
            data,
            weight: self.weight.clone(),
            stratum: self.stratum.clone(),
            psu: self.psu.clone(),
            fpc: self.fpc.clone(),
            replicates: None,
        })
    }

    /// Base sampling weights as a dense vector (nulls become NaN; callers
    /// exclude and count those before estimation).
    pub fn base_weights(&self) -> Result<Vec<f64>> {
        Ok(self
            .weights()?
            .into_iter()
            .map(|w| w.unwrap_or(f64::NAN))
            .collect())
    }

    /// The weights in effect for one estimation pass: the base sampling
    /// weights, or column `r` of the replicate matrix.
    pub fn effective_weights(&self, replicate: Option<usize>) -> Result<Vec<f64>> {
        match replicate {
            None => self.base_weights(),
            Some(r) => {
                let rw = self.replicates.as_ref().ok_or_else(|| SvyError::Design {
                    field: "replicate_weights".into(),
                    detail: "design carries no replicate weights".into(),
                    n_affected: 0,
                })?;
                if r >= rw.n_replicates() {
                    return Err(SvyError::InvalidArgument(format!(
                        "replicate index {} out of range for {} replicates",
                        r,
                        rw.n_replicates()
                    )));
                }
                Ok(rw.column(r))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn frame() -> DataFrame {
        df![
            "w" => [2.0, 2.0, 3.0, 3.0],
            "stratum" => ["a", "a", "b", "b"],
            "day" => ["d1", "d1", "d2", "d2"],
            "y" => [1.0, 2.0, 3.0, 4.0],
        ]
        .unwrap()
    }

    #[test]
    fn test_validate_ok() {
        let d = SamplingDesign::new(frame(), "w")
            .with_strata("stratum")
            .with_psu("day");
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_nonpositive_weight() {
        let data = df!["w" => [1.0, 0.0, -2.0], "y" => [1.0, 2.0, 3.0]].unwrap();
        let d = SamplingDesign::new(data, "w");
        match d.validate() {
            Err(SvyError::Design { n_affected, .. }) => assert_eq!(n_affected, 2),
            other => panic!("expected design error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_validate_rejects_crossed_clusters() {
        let data = df![
            "w" => [1.0, 1.0],
            "stratum" => ["a", "b"],
            "day" => ["d1", "d1"],
        ]
        .unwrap();
        let d = SamplingDesign::new(data, "w")
            .with_strata("stratum")
            .with_psu("day");
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_misaligned_replicates() {
        let rw = ReplicateWeights {
            matrix: array![[1.0, 1.0], [1.0, 1.0]],
            kind: RepWeightKind::Bootstrap,
            scale: 1.0,
            rscales: vec![1.0, 1.0],
        };
        let d = SamplingDesign::new(frame(), "w").with_replicates(rw);
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_subset_keeps_replicates_aligned() {
        let rw = ReplicateWeights {
            matrix: array![
                [10.0, 11.0],
                [20.0, 21.0],
                [30.0, 31.0],
                [40.0, 41.0]
            ],
            kind: RepWeightKind::Bootstrap,
            scale: 1.0,
            rscales: vec![1.0, 1.0],
        };
        let d = SamplingDesign::new(frame(), "w")
            .with_strata("stratum")
            .with_replicates(rw);

        let mask = BooleanChunked::from_slice("mask".into(), &[true, false, false, true]);
        let sub = d.subset(&mask).unwrap();

        assert_eq!(sub.n(), 2);
        let m = &sub.replicates().unwrap().matrix;
        assert_eq!(m.nrows(), 2);
        // Row 0 of the subset is row 0 of the original, row 1 is row 3.
        assert_eq!(m[[0, 0]], 10.0);
        assert_eq!(m[[1, 1]], 41.0);
    }

    #[test]
    fn test_subset_rejects_wrong_mask_length() {
        let d = SamplingDesign::new(frame(), "w");
        let mask = BooleanChunked::from_slice("mask".into(), &[true, false]);
        assert!(d.subset(&mask).is_err());
    }

    #[test]
    fn test_effective_weights_selects_replicate_column() {
        let rw = ReplicateWeights {
            matrix: array![
                [10.0, 11.0],
                [20.0, 21.0],
                [30.0, 31.0],
                [40.0, 41.0]
            ],
            kind: RepWeightKind::Bootstrap,
            scale: 1.0,
            rscales: vec![1.0, 1.0],
        };
        let d = SamplingDesign::new(frame(), "w").with_replicates(rw);
        assert_eq!(d.effective_weights(None).unwrap(), vec![2.0, 2.0, 3.0, 3.0]);
        assert_eq!(
            d.effective_weights(Some(1)).unwrap(),
            vec![11.0, 21.0, 31.0, 41.0]
        );
        assert!(d.effective_weights(Some(2)).is_err());
    }

    #[test]
    fn test_effective_weights_without_replicates() {
        let d = SamplingDesign::new(frame(), "w");
        assert!(d.effective_weights(Some(0)).is_err());
    }

    #[test]
    fn test_derive_with_weights() {
        let d = SamplingDesign::new(frame(), "w");
        let d2 = d.derive_with_weights(vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        assert_eq!(d2.base_weights().unwrap(), vec![1.0; 4]);
        // The original design is untouched.
        assert_eq!(d.base_weights().unwrap(), vec![2.0, 2.0, 3.0, 3.0]);
    }
}
