//! L-BFGS with box constraints via clamping, gradient projection and restarts.

use super::{
    check_problem, negated_cost, projected_gradient_norm, Bounds, BoxConstrainedOptimizer,
    Diagnostics, FuncCounts, Objective, OptimizationResult, OptimizerConfig,
};
use crate::error::{LmmError, Result};
use argmin::core::{CostFunction, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use log::debug;
use std::sync::Arc;

/// Negated, clamped objective in the shape argmin expects.
struct ClampedProblem<'a> {
    objective: &'a dyn Objective,
    bounds: &'a Bounds,
    counts: Arc<FuncCounts>,
}

impl CostFunction for ClampedProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        self.counts.add_cost();
        let clamped = self.bounds.clamp(params);
        negated_cost(self.objective, &clamped).map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

impl Gradient for ClampedProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        params: &Self::Param,
    ) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        self.counts.add_grad();
        let clamped = self.bounds.clamp(params);
        let mut g: Vec<f64> = self
            .objective
            .gradient(&clamped)
            .map_err(|e| argmin::core::Error::msg(e.to_string()))?
            .iter()
            .map(|v| -v)
            .collect();
        if g.iter().any(|v| !v.is_finite()) {
            return Err(argmin::core::Error::msg(format!(
                "Non-finite gradient at {:?}",
                clamped
            )));
        }
        // Components pushing further out of the box are dropped so the line search
        // does not keep stepping into the flat clamped region.
        self.bounds.project_gradient(&clamped, &mut g);
        Ok(g)
    }
}

/// Runs that fail to improve the objective before the restart loop gives up.
const MAX_STALLED_RUNS: usize = 2;

/// L-BFGS maximizer with box constraints.
///
/// argmin's L-BFGS is unconstrained, so its iterate can drift outside the box
/// where the clamped objective is flat. Every run is therefore restarted with a
/// fresh memory from the clamped best point until the projected gradient meets
/// the tolerance, the iteration budget is spent, or runs stop making progress.
/// Convergence is decided on the projected gradient alone.
pub struct LbfgsOptimizer {
    config: OptimizerConfig,
}

/// Outcome of one argmin run.
struct RunOutcome {
    argmax: Vec<f64>,
    iterations: u64,
    message: String,
}

impl LbfgsOptimizer {
    /// Create new L-BFGS optimizer with given configuration
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    fn run_once(
        &self,
        objective: &dyn Objective,
        bounds: &Bounds,
        start: &[f64],
        max_iter: u64,
        counts: &Arc<FuncCounts>,
    ) -> Result<RunOutcome> {
        let problem = ClampedProblem {
            objective,
            bounds,
            counts: counts.clone(),
        };

        let linesearch = MoreThuenteLineSearch::new();
        let solver = LBFGS::new(linesearch, self.config.memory)
            .with_tolerance_grad(self.config.tol)
            .map_err(|e| LmmError::InvalidInput(format!("Invalid optimizer tolerance: {e}")))?
            .with_tolerance_cost(f64::EPSILON)
            .map_err(|e| LmmError::InvalidInput(format!("Invalid optimizer tolerance: {e}")))?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.param(start.to_vec()).max_iters(max_iter))
            .run()
            .map_err(|e| LmmError::NumericalFailure(format!("L-BFGS failed: {}", e)))?;

        let state = res.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| LmmError::NumericalFailure("No best parameters found".to_string()))?;

        Ok(RunOutcome {
            argmax: bounds.clamp(best),
            iterations: state.get_iter(),
            message: state.get_termination_status().to_string(),
        })
    }
}

impl Default for LbfgsOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

impl BoxConstrainedOptimizer for LbfgsOptimizer {
    fn name(&self) -> &'static str {
        "lbfgs"
    }

    fn maximize(
        &self,
        objective: &dyn Objective,
        bounds: &Bounds,
        initial: &[f64],
    ) -> Result<OptimizationResult> {
        check_problem(bounds, initial)?;
        let tol = self.config.tol;
        let mut argmax = bounds.clamp(initial);
        let mut value = -negated_cost(objective, &argmax)?;
        let mut gradient_norm = projected_gradient_norm(objective, bounds, &argmax)?;

        // A starting point that is already stationary would hand the line search a
        // zero direction.
        if gradient_norm <= tol {
            debug!("L-BFGS: initial point is stationary (|g| = {:.3e})", gradient_norm);
            return Ok(OptimizationResult {
                argmax,
                value,
                diagnostics: Diagnostics {
                    iterations: 0,
                    cost_evaluations: 1,
                    gradient_evaluations: 1,
                    gradient_norm,
                    converged: true,
                    message: "Initial point satisfies the gradient tolerance".to_string(),
                },
            });
        }

        let counts = Arc::new(FuncCounts::default());
        let mut iterations = 0u64;
        let mut runs = 0usize;
        let mut stalled = 0usize;
        let mut last_message = String::new();

        while gradient_norm > tol && iterations < self.config.max_iter && stalled < MAX_STALLED_RUNS
        {
            let run = self.run_once(
                objective,
                bounds,
                &argmax,
                self.config.max_iter - iterations,
                &counts,
            )?;
            runs += 1;
            iterations += run.iterations;
            last_message = run.message;

            let run_value = -negated_cost(objective, &run.argmax)?;
            if run.iterations > 0 && run_value > value {
                stalled = 0;
            } else {
                stalled += 1;
            }
            if run_value >= value {
                argmax = run.argmax;
                value = run_value;
            }
            gradient_norm = projected_gradient_norm(objective, bounds, &argmax)?;
            debug!(
                "L-BFGS run {}: {} iterations, {} (value = {:.8}, |g| = {:.3e})",
                runs, run.iterations, last_message, value, gradient_norm
            );
        }

        let converged = gradient_norm <= tol;
        let message = if converged {
            format!(
                "Projected gradient norm {:.3e} within tolerance after {} run(s)",
                gradient_norm, runs
            )
        } else if iterations >= self.config.max_iter {
            format!(
                "Maximum number of iterations reached (|g| = {:.3e})",
                gradient_norm
            )
        } else {
            format!(
                "No progress after {} run(s), last run: {} (|g| = {:.3e})",
                runs, last_message, gradient_norm
            )
        };

        debug!("L-BFGS finished after {} iterations: {}", iterations, message);

        Ok(OptimizationResult {
            argmax,
            value,
            diagnostics: Diagnostics {
                iterations,
                cost_evaluations: counts.costs() + runs + 1,
                gradient_evaluations: counts.grads() + runs + 1,
                gradient_norm,
                converged,
                message,
            },
        })
    }
}
