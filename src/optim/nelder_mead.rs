//! Derivative-free Nelder–Mead simplex search on the clamped objective.

use super::{
    check_problem, negated_cost, projected_gradient_norm, Bounds, BoxConstrainedOptimizer,
    Diagnostics, FuncCounts, Objective, OptimizationResult, OptimizerConfig,
};
use crate::error::{LmmError, Result};
use argmin::core::{CostFunction, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::neldermead::NelderMead;
use log::debug;
use std::sync::Arc;

struct SimplexProblem<'a> {
    objective: &'a dyn Objective,
    bounds: &'a Bounds,
    counts: Arc<FuncCounts>,
}

impl CostFunction for SimplexProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        self.counts.add_cost();
        let clamped = self.bounds.clamp(params);
        negated_cost(self.objective, &clamped).map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

/// Nelder–Mead maximizer; bounds are honoured by evaluating at the clamped point.
pub struct NelderMeadOptimizer {
    config: OptimizerConfig,
}

impl NelderMeadOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Initial simplex: the start point plus one step along each axis.
    ///
    /// Steps that would leave the box are taken in the opposite direction.
    fn initial_simplex(bounds: &Bounds, start: &[f64]) -> Vec<Vec<f64>> {
        let mut vertices = Vec::with_capacity(start.len() + 1);
        vertices.push(start.to_vec());
        for i in 0..start.len() {
            let h = 0.1 * start[i].abs().max(1.0);
            let mut vertex = start.to_vec();
            vertex[i] = if start[i] + h <= bounds.upper()[i] {
                start[i] + h
            } else {
                start[i] - h
            };
            vertices.push(bounds.clamp(&vertex));
        }
        vertices
    }
}

impl Default for NelderMeadOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

impl BoxConstrainedOptimizer for NelderMeadOptimizer {
    fn name(&self) -> &'static str {
        "nelder-mead"
    }

    fn maximize(
        &self,
        objective: &dyn Objective,
        bounds: &Bounds,
        initial: &[f64],
    ) -> Result<OptimizationResult> {
        check_problem(bounds, initial)?;
        let start = bounds.clamp(initial);
        // fail early on a bad starting point instead of inside the simplex
        negated_cost(objective, &start)?;

        let counts = Arc::new(FuncCounts::default());
        let problem = SimplexProblem {
            objective,
            bounds,
            counts: counts.clone(),
        };

        let sd_tol = (self.config.tol * 1e-4).max(1e-14);
        let solver = NelderMead::new(Self::initial_simplex(bounds, &start))
            .with_sd_tolerance(sd_tol)
            .map_err(|e| LmmError::InvalidInput(format!("Invalid optimizer tolerance: {e}")))?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.max_iters(self.config.max_iter))
            .run()
            .map_err(|e| LmmError::NumericalFailure(format!("Nelder-Mead failed: {}", e)))?;

        let state = res.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| LmmError::NumericalFailure("No best parameters found".to_string()))?;
        let argmax = bounds.clamp(best);
        let value = -state.get_best_cost();
        let iterations = state.get_iter();

        let termination = state.get_termination_status();
        let converged = matches!(
            termination,
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
        );
        let message = termination.to_string();
        let gradient_norm = projected_gradient_norm(objective, bounds, &argmax)?;

        debug!(
            "Nelder-Mead finished after {} iterations: {} (|g| = {:.3e})",
            iterations, message, gradient_norm
        );

        Ok(OptimizationResult {
            argmax,
            value,
            diagnostics: Diagnostics {
                iterations,
                cost_evaluations: counts.costs() + 1,
                gradient_evaluations: 1,
                gradient_norm,
                converged,
                message,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Quadratic;

    impl Objective for Quadratic {
        fn value(&self, params: &[f64]) -> Result<f64> {
            Ok(-(params[0] - 2.0).powi(2) - 4.0 * (params[1] - 3.0).powi(2))
        }
    }

    #[test]
    fn test_maximize_interior() {
        let optimizer = NelderMeadOptimizer::default();
        let bounds = Bounds::new(vec![-10.0, -10.0], vec![10.0, 10.0]).unwrap();

        let result = optimizer.maximize(&Quadratic, &bounds, &[0.0, 0.0]).unwrap();

        assert!(result.diagnostics.converged, "{}", result.diagnostics.message);
        assert_relative_eq!(result.argmax[0], 2.0, epsilon = 1e-3);
        assert_relative_eq!(result.argmax[1], 3.0, epsilon = 1e-3);
    }

    #[test]
    fn test_result_stays_in_bounds() {
        let optimizer = NelderMeadOptimizer::default();
        let bounds = Bounds::new(vec![-1.0, -1.0], vec![1.0, 1.0]).unwrap();

        let result = optimizer.maximize(&Quadratic, &bounds, &[0.0, 0.0]).unwrap();

        assert!(bounds.contains(&result.argmax));
        assert_relative_eq!(result.argmax[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(result.argmax[1], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_initial_simplex_respects_upper_bound() {
        let bounds = Bounds::new(vec![0.0, 0.0], vec![1.0, 5.0]).unwrap();
        let simplex = NelderMeadOptimizer::initial_simplex(&bounds, &[1.0, 2.0]);

        assert_eq!(simplex.len(), 3);
        assert_eq!(simplex[1], vec![0.9, 2.0]);
        assert_relative_eq!(simplex[2][1], 2.2, epsilon = 1e-12);
    }
}
