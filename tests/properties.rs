// tests/properties.rs
//! End-to-end scenarios: reference numbers for the estimators, the
//! method-fallback policy, replicate-weight alignment, category
//! aggregation, and the effort x CPUE combination.

use approx::assert_relative_eq;
use ndarray::Array2;
use polars::prelude::*;

use creel_svy::{
    combine, compute, diagnose, sum_category_columns, Correlation, DiagnosticCode, EngineOptions,
    Estimand, RepWeightKind, ReplicateWeights, SamplingDesign, SvyError, VarianceMethod,
    VarianceResult,
};

fn unit_total_design() -> SamplingDesign {
    let data = df![
        "w" => [1.0; 10],
        "y" => [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0],
    ]
    .unwrap();
    SamplingDesign::new(data, "w")
}

#[test]
fn ht_total_reference_scenario() {
    let results = compute(
        &unit_total_design(),
        &Estimand::total("y"),
        VarianceMethod::Linearization,
        &EngineOptions::default(),
    )
    .unwrap();
    assert_eq!(results.len(), 1);
    let r = &results[0];
    assert_relative_eq!(r.estimate, 55.0);
    // Unweighted, unclustered: the linearized variance of the total is
    // n * s^2 = (10/9) * 82.5.
    assert_relative_eq!(r.se, (10.0f64 / 9.0 * 82.5).sqrt(), max_relative = 1e-12);
    assert_eq!(r.method, "linearization");
    assert_eq!(r.n_used, 10);
}

#[test]
fn linearized_mean_matches_classical_srs_variance() {
    // A mean via the mean-of-ratios mode with a unit denominator; its
    // linearized variance must be the textbook s^2 / n.
    let data = df![
        "w" => [1.0; 10],
        "y" => [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0],
        "one" => [1.0; 10],
    ]
    .unwrap();
    let d = SamplingDesign::new(data, "w");
    let results = compute(
        &d,
        &Estimand::mean_of_ratios("y", "one"),
        VarianceMethod::Linearization,
        &EngineOptions::default(),
    )
    .unwrap();
    let r = &results[0];
    let s2 = 82.5 / 9.0;
    assert_relative_eq!(r.estimate, 5.5);
    assert_relative_eq!(r.se * r.se, s2 / 10.0, max_relative = 1e-12);
}

#[test]
fn passthrough_variance_invariant_to_replicate_column_order() {
    let n = 5;
    let n_reps = 4;
    let base = df![
        "w" => [1.0; 5],
        "y" => [2.0, 4.0, 6.0, 8.0, 10.0],
    ]
    .unwrap();
    let flat: Vec<f64> = (0..n * n_reps).map(|k| 1.0 + (k % 7) as f64 / 10.0).collect();
    let matrix = Array2::from_shape_vec((n, n_reps), flat).unwrap();

    let var_of = |matrix: Array2<f64>| -> f64 {
        let reps = ReplicateWeights {
            matrix,
            kind: RepWeightKind::Bootstrap,
            scale: 1.0 / (n_reps as f64 - 1.0),
            rscales: vec![1.0; n_reps],
        };
        let d = SamplingDesign::new(base.clone(), "w").with_replicates(reps);
        let results = compute(
            &d,
            &Estimand::total("y"),
            VarianceMethod::ReplicatePassthrough,
            &EngineOptions::default(),
        )
        .unwrap();
        assert_eq!(results[0].method, "replicate");
        results[0].se * results[0].se
    };

    let forward = var_of(matrix.clone());
    let mut reversed = Array2::zeros((n, n_reps));
    for r in 0..n_reps {
        reversed.column_mut(r).assign(&matrix.column(n_reps - 1 - r));
    }
    assert_relative_eq!(forward, var_of(reversed), max_relative = 1e-12);
}

#[test]
fn passthrough_variance_invariant_to_row_permutation() {
    // Replicate rows and frame rows reordered together must describe the
    // same design.
    let matrix = Array2::from_shape_vec(
        (4, 3),
        vec![1.0, 2.0, 0.5, 0.8, 1.1, 1.4, 1.2, 0.9, 1.0, 1.5, 0.6, 1.3],
    )
    .unwrap();
    let var_of = |ys: &[f64], rows: &[usize]| -> f64 {
        let data = df![
            "w" => [1.0; 4],
            "y" => ys.to_vec(),
        ]
        .unwrap();
        let permuted = matrix.select(ndarray::Axis(0), rows);
        let d = SamplingDesign::new(data, "w").with_replicates(ReplicateWeights {
            matrix: permuted,
            kind: RepWeightKind::Bootstrap,
            scale: 0.5,
            rscales: vec![1.0; 3],
        });
        let results = compute(
            &d,
            &Estimand::total("y"),
            VarianceMethod::ReplicatePassthrough,
            &EngineOptions::default(),
        )
        .unwrap();
        results[0].se * results[0].se
    };
    let forward = var_of(&[3.0, 1.0, 4.0, 1.5], &[0, 1, 2, 3]);
    let shuffled = var_of(&[4.0, 1.5, 3.0, 1.0], &[2, 3, 0, 1]);
    assert_relative_eq!(forward, shuffled, max_relative = 1e-12);
}

#[test]
fn ratio_modes_coincide_with_constant_denominator() {
    let data = df![
        "w" => [2.0, 1.0, 3.0, 1.0],
        "catch" => [3.0, 5.0, 1.0, 7.0],
        "hours" => [4.0; 4],
    ]
    .unwrap();
    let d = SamplingDesign::new(data, "w");
    let opts = EngineOptions::default();
    let rom = compute(&d, &Estimand::ratio("catch", "hours"), VarianceMethod::Linearization, &opts)
        .unwrap();
    let mor = compute(
        &d,
        &Estimand::mean_of_ratios("catch", "hours"),
        VarianceMethod::Linearization,
        &opts,
    )
    .unwrap();
    assert_relative_eq!(rom[0].estimate, mor[0].estimate, max_relative = 1e-12);
    assert_relative_eq!(rom[0].se, mor[0].se, max_relative = 1e-12);
}

#[test]
fn pre_aggregated_total_beats_independent_category_sums() {
    // Two positively correlated per-unit catches. Aggregating within the
    // unit before estimation keeps the covariance; adding the two
    // standard errors as if independent can only overstate it.
    let mut data = df![
        "w" => [1.0; 6],
        "walleye" => [1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        "perch" => [1.5, 2.0, 3.5, 4.0, 5.5, 6.0],
    ]
    .unwrap();
    let (agg, diags) = sum_category_columns(&data, &["walleye", "perch"]).unwrap();
    assert!(diags.is_empty());
    data.with_column(agg.into_series()).unwrap();
    let d = SamplingDesign::new(data, "w");
    let opts = EngineOptions::default();

    let run = |col: &str| -> VarianceResult {
        compute(&d, &Estimand::total(col), VarianceMethod::Linearization, &opts)
            .unwrap()
            .remove(0)
    };
    let combined = run("category_total");
    let walleye = run("walleye");
    let perch = run("perch");

    assert_relative_eq!(
        combined.estimate,
        walleye.estimate + perch.estimate,
        max_relative = 1e-12
    );
    let naive_se = walleye.se + perch.se;
    assert!(combined.se <= naive_se + 1e-12);
}

#[test]
fn singleton_strata_flagged_and_estimated() {
    let data = df![
        "w" => [1.0, 1.0],
        "stratum" => ["north", "south"],
        "y" => [4.0, 10.0],
    ]
    .unwrap();
    let d = SamplingDesign::new(data, "w").with_strata("stratum");

    let audit = diagnose(&d);
    let singletons: Vec<&String> = audit
        .warnings
        .iter()
        .filter(|w| w.contains("singleton stratum"))
        .collect();
    assert_eq!(singletons.len(), 2);
    assert!(singletons.iter().any(|w| w.contains("north")));
    assert!(singletons.iter().any(|w| w.contains("south")));

    let results = compute(
        &d,
        &Estimand::total("y"),
        VarianceMethod::Linearization,
        &EngineOptions::default(),
    )
    .unwrap();
    let r = &results[0];
    assert!(r.se.is_finite());
    assert!(r
        .diagnostics
        .iter()
        .any(|d| d.code == DiagnosticCode::LonelyPsuAdjusted));
}

#[test]
fn bootstrap_with_two_psus_falls_back_to_linearization() {
    let data = df![
        "w" => [1.0; 6],
        "stratum" => ["a", "a", "a", "a", "b", "b"],
        "day" => ["d1", "d1", "d2", "d2", "d3", "d4"],
        "y" => [1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
    ]
    .unwrap();
    let d = SamplingDesign::new(data, "w")
        .with_strata("stratum")
        .with_psu("day");
    let results = compute(
        &d,
        &Estimand::total("y"),
        VarianceMethod::Bootstrap,
        &EngineOptions {
            n_replicates: 500,
            ..EngineOptions::default()
        },
    )
    .unwrap();
    let r = &results[0];
    assert_eq!(r.method, "linearization");
    assert!(r
        .diagnostics
        .iter()
        .any(|d| d.code == DiagnosticCode::MethodFallback));
    assert!(r.se.is_finite());
}

fn grouped_results(groups: &[&str], estimates: &[f64]) -> Vec<VarianceResult> {
    let rows: Vec<(String, f64)> = groups
        .iter()
        .flat_map(|g| {
            estimates
                .iter()
                .map(move |e| (g.to_string(), *e))
        })
        .collect();
    let data = df![
        "w" => vec![1.0; rows.len()],
        "area" => rows.iter().map(|(g, _)| g.clone()).collect::<Vec<_>>(),
        "y" => rows.iter().map(|(_, e)| *e).collect::<Vec<_>>(),
    ]
    .unwrap();
    let d = SamplingDesign::new(data, "w");
    compute(
        &d,
        &Estimand::total("y").group_by(["area"]),
        VarianceMethod::Linearization,
        &EngineOptions::default(),
    )
    .unwrap()
}

#[test]
fn harvest_join_keeps_overlap_and_rejects_disjoint() {
    let effort = grouped_results(&["A", "B"], &[10.0, 12.0, 14.0]);
    let cpue = grouped_results(&["B", "C"], &[0.4, 0.5, 0.6]);

    let out = combine(&effort, &cpue, Correlation::Independent, 0.95).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].group, Some(vec!["B".to_string()]));
    assert!(out[0]
        .diagnostics
        .iter()
        .any(|d| d.code == DiagnosticCode::PartialGroupJoin));

    let effort_a_only: Vec<VarianceResult> = effort
        .iter()
        .filter(|r| r.group == Some(vec!["A".to_string()]))
        .cloned()
        .collect();
    assert!(matches!(
        combine(&effort_a_only, &cpue, Correlation::Independent, 0.95),
        Err(SvyError::EmptyJoin)
    ));
}

#[test]
fn combine_independent_equals_zero_correlation() {
    let effort = grouped_results(&["A", "B"], &[8.0, 9.0]);
    let cpue = grouped_results(&["A", "B"], &[0.5, 0.6]);
    let ind = combine(&effort, &cpue, Correlation::Independent, 0.95).unwrap();
    let zero = combine(&effort, &cpue, Correlation::Fixed(0.0), 0.95).unwrap();
    assert_eq!(ind.len(), zero.len());
    for (a, b) in ind.iter().zip(zero.iter()) {
        assert_relative_eq!(a.estimate, b.estimate);
        assert_relative_eq!(a.se, b.se);
        assert_relative_eq!(a.ci_low, b.ci_low);
    }
}

#[test]
fn auto_correlation_fails_fast() {
    let effort = grouped_results(&["A"], &[8.0, 9.0]);
    let cpue = grouped_results(&["A"], &[0.5, 0.6]);
    assert!(matches!(
        combine(&effort, &cpue, Correlation::Auto, 0.95),
        Err(SvyError::Unsupported(_))
    ));
}
