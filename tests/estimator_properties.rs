//! Behavioural properties of the estimator: optimality, invariance, boundary
//! cases and the error taxonomy.

use approx::assert_relative_eq;
use lmm_mle::prelude::*;
use nalgebra::DMatrix;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn toy() -> (Vec<f64>, DMatrix<f64>, Grouping) {
    let y = vec![10.0, 25.0, 3.0, 6.0];
    let x = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0]);
    let groups = Grouping::from_labels(&["Ind1", "Ind1", "Ind2", "Ind2"]);
    (y, x, groups)
}

/// Unbalanced design: five groups of sizes 3, 2, 4, 3, 2 with one covariate.
fn unbalanced() -> (Vec<f64>, DMatrix<f64>, Grouping) {
    let y = vec![
        4.1, 5.3, 3.8, 7.9, 8.4, 2.2, 1.9, 2.8, 3.1, 6.0, 6.6, 5.1, 9.2, 8.8,
    ];
    let covariate = [
        0.5, 1.2, 0.3, 2.0, 2.2, -0.4, -0.8, 0.1, 0.4, 1.0, 1.5, 0.9, 2.5, 2.1,
    ];
    let x = DMatrix::from_fn(y.len(), 2, |i, j| if j == 0 { 1.0 } else { covariate[i] });
    let groups = Grouping::from_labels(&[
        "a", "a", "a", "b", "b", "c", "c", "c", "c", "d", "d", "d", "e", "e",
    ]);
    (y, x, groups)
}

/// Delegates to L-BFGS and counts how often it is asked to optimize.
struct RecordingOptimizer {
    calls: Arc<AtomicUsize>,
    inner: LbfgsOptimizer,
}

impl RecordingOptimizer {
    fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: calls.clone(),
                inner: LbfgsOptimizer::default(),
            },
            calls,
        )
    }
}

impl BoxConstrainedOptimizer for RecordingOptimizer {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn maximize(
        &self,
        objective: &dyn Objective,
        bounds: &Bounds,
        initial: &[f64],
    ) -> Result<OptimizationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.maximize(objective, bounds, initial)
    }
}

fn recording_estimator(config: LmmConfig) -> (LmmEstimator, Arc<AtomicUsize>) {
    let (optimizer, calls) = RecordingOptimizer::new();
    (LmmEstimator::with_optimizer(config, Box::new(optimizer)), calls)
}

#[test]
fn test_optimum_dominates_grid() {
    let (y, x, groups) = toy();
    let fit = fit_lmm(&y, &x, &groups, &LmmConfig::default()).unwrap();
    let objective = LogLikelihood::new(&y, &x, &groups).unwrap();

    let axis = |lo: f64, hi: f64| -> Vec<f64> {
        (0..8).map(|i| lo + (hi - lo) * i as f64 / 7.0).collect()
    };
    let mut n_points = 0;
    for &sigma in &axis(0.5, 12.0) {
        for &sigma_s in &axis(0.5, 12.0) {
            for &b0 in &axis(0.0, 13.0) {
                for &b1 in &axis(2.0, 16.0) {
                    let ll = objective.value(&[sigma, sigma_s, b0, b1]).unwrap();
                    assert!(
                        ll <= fit.log_likelihood + 1e-9,
                        "grid point ({}, {}, {}, {}) has log L {} > {}",
                        sigma,
                        sigma_s,
                        b0,
                        b1,
                        ll,
                        fit.log_likelihood
                    );
                    n_points += 1;
                }
            }
        }
    }
    assert_eq!(n_points, 4096);
}

#[test]
fn test_row_permutation_invariance() {
    let (y, x, groups) = unbalanced();
    let order = [13, 2, 7, 0, 11, 5, 9, 1, 12, 4, 8, 3, 10, 6];

    let y_perm: Vec<f64> = order.iter().map(|&i| y[i]).collect();
    let x_perm = x.select_rows(order.iter());
    let groups_perm = groups.permuted(&order).unwrap();

    let config = LmmConfig::default();
    let fit = fit_lmm(&y, &x, &groups, &config).unwrap();
    let fit_perm = fit_lmm(&y_perm, &x_perm, &groups_perm, &config).unwrap();

    for j in 0..2 {
        assert_relative_eq!(fit.beta[j], fit_perm.beta[j], epsilon = 1e-4, max_relative = 1e-4);
    }
    assert_relative_eq!(fit.sigma_squared, fit_perm.sigma_squared, max_relative = 1e-4);
    assert_relative_eq!(
        fit.sigma_s_squared,
        fit_perm.sigma_s_squared,
        epsilon = 1e-6,
        max_relative = 1e-4
    );
    assert_relative_eq!(fit.log_likelihood, fit_perm.log_likelihood, max_relative = 1e-8);
}

#[test]
fn test_unbalanced_backends_agree() {
    let (y, x, groups) = unbalanced();
    let lbfgs = fit_lmm(&y, &x, &groups, &LmmConfig::default()).unwrap();
    let nelder_mead = fit_lmm(
        &y,
        &x,
        &groups,
        &LmmConfig {
            optimizer: OptimizerKind::NelderMead,
            max_iterations: 5000,
            ..LmmConfig::default()
        },
    )
    .unwrap();

    assert!(lbfgs.converged && nelder_mead.converged);
    assert_relative_eq!(lbfgs.log_likelihood, nelder_mead.log_likelihood, epsilon = 1e-4);
    assert_relative_eq!(lbfgs.beta[1], nelder_mead.beta[1], epsilon = 1e-2);
}

#[test]
fn test_unbalanced_local_optimality() {
    let (y, x, groups) = unbalanced();
    let fit = fit_lmm(&y, &x, &groups, &LmmConfig::default()).unwrap();
    let objective = LogLikelihood::new(&y, &x, &groups).unwrap();
    let best = fit.theta().to_vec();

    for i in 0..best.len() {
        for step in [-1e-2, 1e-2] {
            let mut probe = best.clone();
            probe[i] += step;
            if probe[i] < fit.lower_bounds[i] {
                continue;
            }
            assert!(objective.value(&probe).unwrap() <= fit.log_likelihood + 1e-9);
        }
    }
}

#[test]
fn test_zero_within_group_variance() {
    // identical observations within each group
    let y = vec![5.0, 5.0, 2.0, 2.0, 8.0, 8.0];
    let x = DMatrix::from_element(6, 1, 1.0);
    let groups = Grouping::from_labels(&["a", "a", "b", "b", "c", "c"]);

    let fit = fit_lmm(&y, &x, &groups, &LmmConfig::default()).unwrap();

    assert!(fit.converged);
    assert_relative_eq!(fit.sigma(), fit.lower_bounds[0], epsilon = 1e-9);
    assert!(fit.on_boundary().contains(&"sigma"));
    assert_relative_eq!(fit.sigma_s_squared, 6.0, epsilon = 1e-3);
    assert_relative_eq!(fit.beta[0], 5.0, epsilon = 1e-6);
}

#[test]
fn test_zero_between_group_variance_collapses_to_ols() {
    // identical group means
    let y = vec![1.0, 3.0, 1.0, 3.0, 1.0, 3.0];
    let x = DMatrix::from_element(6, 1, 1.0);
    let groups = Grouping::from_labels(&["a", "a", "b", "b", "c", "c"]);

    let fit = fit_lmm(&y, &x, &groups, &LmmConfig::default()).unwrap();
    let ols = fit_ols(&y, &x).unwrap();

    assert!(fit.converged);
    assert!(fit.sigma_s() < 1e-2);
    assert!(fit.on_boundary().contains(&"sigma_s"));
    assert_relative_eq!(fit.sigma_squared, ols.sigma_squared_ml, epsilon = 1e-4);
    assert_relative_eq!(fit.beta[0], ols.coefficients[0], epsilon = 1e-6);
    assert_relative_eq!(fit.log_likelihood, ols.log_likelihood, epsilon = 1e-4);
}

#[test]
fn test_singleton_groups_are_degenerate() {
    let (y, x, _) = toy();
    let groups = Grouping::from_labels(&["a", "b", "c", "d"]);
    let ols = fit_ols(&y, &x).unwrap();

    match fit_lmm(&y, &x, &groups, &LmmConfig::default()) {
        Ok(fit) => {
            assert_eq!(fit.status, ConvergenceStatus::Degenerate);
            assert_relative_eq!(
                fit.sigma_squared + fit.sigma_s_squared,
                ols.sigma_squared_ml,
                max_relative = 1e-4
            );
        }
        Err(e) => assert!(e.is_numerical_failure(), "unexpected error: {}", e),
    }
}

#[test]
fn test_too_few_observations_skips_optimizer() {
    let y = vec![1.0, 2.0];
    let x = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 1.0, 1.0]);
    let groups = Grouping::from_labels(&["a", "a"]);
    let (estimator, calls) = recording_estimator(LmmConfig::default());

    let err = estimator.fit(&y, &x, &groups).unwrap_err();

    assert!(err.is_invalid_input(), "unexpected error: {}", err);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_dimension_mismatch_skips_optimizer() {
    let (y, x, _) = toy();
    let groups = Grouping::from_labels(&["Ind1", "Ind1", "Ind2"]);
    let (estimator, calls) = recording_estimator(LmmConfig::default());

    assert!(estimator.fit(&y, &x, &groups).unwrap_err().is_invalid_input());
    assert!(estimator.fit(&y[..3], &x, &groups).unwrap_err().is_invalid_input());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_empty_declared_group_is_invalid() {
    let (y, x, _) = toy();
    let groups =
        Grouping::with_levels(&["Ind1", "Ind1", "Ind2", "Ind2"], &["Ind1", "Ind2", "Ind3"]).unwrap();
    let (estimator, calls) = recording_estimator(LmmConfig::default());

    let err = estimator.fit(&y, &x, &groups).unwrap_err();

    assert!(err.is_invalid_input());
    assert!(err.to_string().contains("Ind3"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_inconsistent_bounds_are_invalid() {
    let (y, x, groups) = toy();
    let config = LmmConfig {
        lower_bounds: Some(vec![1.0, 1.0, 0.0, 0.0]),
        upper_bounds: Some(vec![10.0, 10.0, 5.0, -5.0]),
        ..LmmConfig::default()
    };
    let (estimator, calls) = recording_estimator(config);

    assert!(estimator.fit(&y, &x, &groups).unwrap_err().is_invalid_input());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let config = LmmConfig {
        upper_bounds: Some(vec![10.0, 10.0]),
        ..LmmConfig::default()
    };
    assert!(fit_lmm(&y, &x, &groups, &config).unwrap_err().is_invalid_input());
}

#[test]
fn test_singular_covariance_at_initial_guess() {
    let (y, x, groups) = toy();
    let config = LmmConfig {
        variance_floor: 0.0,
        lower_bounds: Some(vec![0.0, 0.0, f64::NEG_INFINITY, f64::NEG_INFINITY]),
        initial_guess: Some(vec![0.0, 0.0, 6.5, 9.0]),
        ..LmmConfig::default()
    };
    let (estimator, calls) = recording_estimator(config);

    let err = estimator.fit(&y, &x, &groups).unwrap_err();

    assert!(err.is_numerical_failure(), "unexpected error: {}", err);
    assert!(!err.is_invalid_input());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_iteration_budget_exhausted() {
    let (y, x, groups) = toy();
    let config = LmmConfig {
        initial_guess: Some(vec![3.0, 3.0, 5.0, 5.0]),
        max_iterations: 1,
        ..LmmConfig::default()
    };

    let err = fit_lmm(&y, &x, &groups, &config).unwrap_err();

    assert!(matches!(err, LmmError::NotConverged { .. }));
    assert!(err.is_numerical_failure());
    let last = err.last_iterate().unwrap();
    assert_eq!(last.status, ConvergenceStatus::DidNotConverge);
    assert!(!last.converged);
    assert!(last.iterations <= 1);
    assert!(last.log_likelihood.is_finite());
    assert!(err.to_string().contains("Maximum number of iterations"), "{}", err);
    assert!(err.to_string().contains(&last.diagnostics.message));
}

#[test]
fn test_injected_optimizer_is_used() {
    let (y, x, groups) = toy();
    let (estimator, calls) = recording_estimator(LmmConfig::default());

    let fit = estimator.fit(&y, &x, &groups).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(fit.optimizer, "recording");
    assert_relative_eq!(fit.beta[1], 9.0, max_relative = 1e-4);
}
