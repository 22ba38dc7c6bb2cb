// src/combine.rs
//! Combining independently estimated effort and catch-per-unit-effort
//! into total harvest, with a delta-method variance for the product.

use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::HashMap;

use crate::error::{Diagnostic, DiagnosticCode, Result, SvyError};
use crate::estimation::engine::VarianceResult;

/// How the effort and CPUE estimates covary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correlation {
    /// Treat the two estimates as uncorrelated. Usually conservative in
    /// creel settings, where effort and catch rate tend to covary
    /// positively on good days.
    Independent,
    /// A correlation coefficient in `[-1, 1]` supplied by the analyst,
    /// e.g. from a previous season's shared-replicate run.
    Fixed(f64),
    /// Estimate the correlation from shared replicates. Not implemented:
    /// requesting it fails fast rather than silently substituting an
    /// assumption the caller did not make.
    Auto,
}

/// Delta-method product of per-group effort and CPUE estimates:
/// `H = E * C` with
/// `Var(H) = E^2 Var(C) + C^2 Var(E) + 2 E C rho se(E) se(C)`.
///
/// Groups join on their tuple values; effort order is preserved. A join
/// with no common groups is an error, a partial join succeeds with a
/// warning on every returned row.
pub fn combine(
    effort: &[VarianceResult],
    cpue: &[VarianceResult],
    correlation: Correlation,
    conf_level: f64,
) -> Result<Vec<VarianceResult>> {
    let rho = match correlation {
        Correlation::Independent => 0.0,
        Correlation::Fixed(r) => {
            if !(-1.0..=1.0).contains(&r) || !r.is_finite() {
                return Err(SvyError::InvalidArgument(format!(
                    "correlation must lie in [-1, 1], got {}",
                    r
                )));
            }
            r
        }
        Correlation::Auto => {
            return Err(SvyError::Unsupported(
                "automatic correlation estimation requires shared replicate weights, \
                 which this build does not carry; pass Correlation::Independent or \
                 Correlation::Fixed"
                    .into(),
            ));
        }
    };
    if !(conf_level > 0.0 && conf_level < 1.0) {
        return Err(SvyError::InvalidArgument(format!(
            "confidence level must lie in (0, 1), got {}",
            conf_level
        )));
    }

    let cpue_by_group: HashMap<&Option<Vec<String>>, &VarianceResult> =
        cpue.iter().map(|r| (&r.group, r)).collect();

    let mut joined: Vec<(&VarianceResult, &VarianceResult)> = Vec::new();
    for e in effort {
        if let Some(c) = cpue_by_group.get(&e.group) {
            joined.push((e, c));
        }
    }
    if joined.is_empty() {
        return Err(SvyError::EmptyJoin);
    }
    let unmatched = (effort.len() - joined.len()) + (cpue.len() - joined.len());
    if unmatched > 0 {
        log::warn!(
            "effort/CPUE join dropped {} unmatched group(s)",
            unmatched
        );
    }

    let zcrit = match Normal::new(0.0, 1.0) {
        Ok(dist) => dist.inverse_cdf(0.5 + conf_level / 2.0),
        Err(_) => f64::NAN,
    };

    let mut results = Vec::with_capacity(joined.len());
    for (e, c) in joined {
        let estimate = e.estimate * c.estimate;
        let var = e.estimate.powi(2) * c.se.powi(2)
            + c.estimate.powi(2) * e.se.powi(2)
            + 2.0 * e.estimate * c.estimate * rho * e.se * c.se;
        let se = if var.is_finite() { var.max(0.0).sqrt() } else { f64::NAN };

        let deff = if e.deff.is_finite() && e.deff > 0.0 && c.deff.is_finite() && c.deff > 0.0 {
            (e.deff * c.deff).sqrt()
        } else {
            f64::NAN
        };

        let mut diagnostics = Vec::new();
        if unmatched > 0 {
            diagnostics.push(Diagnostic::warning(
                DiagnosticCode::PartialGroupJoin,
                format!("{} group(s) present on only one side of the join", unmatched),
                unmatched,
            ));
        }

        results.push(VarianceResult {
            group: e.group.clone(),
            estimate,
            se,
            ci_low: estimate - zcrit * se,
            ci_high: estimate + zcrit * se,
            deff,
            method: "delta_product".to_string(),
            n_used: e.n_used.min(c.n_used),
            degrees_of_freedom: e.degrees_of_freedom.min(c.degrees_of_freedom),
            diagnostics,
        });
    }
    Ok(results)
}
