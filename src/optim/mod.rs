//! Box-constrained numerical optimization.
//!
//! The estimator only needs the [`BoxConstrainedOptimizer`] capability:
//! maximize a scalar objective over `lower <= x <= upper` from an initial guess.
//! Two argmin-backed implementations are provided:
//!
//! - [`LbfgsOptimizer`]: L-BFGS with Moré–Thuente line search, bounds enforced by
//!   clamping and gradient projection.
//! - [`NelderMeadOptimizer`]: derivative-free simplex search on the clamped objective.

mod lbfgs;
mod nelder_mead;

pub use lbfgs::LbfgsOptimizer;
pub use nelder_mead::NelderMeadOptimizer;

use crate::error::{LmmError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A scalar objective over a flat parameter vector.
pub trait Objective: Send + Sync {
    /// Evaluate the objective.
    fn value(&self, params: &[f64]) -> Result<f64>;

    /// Gradient of the objective (central differences unless overridden).
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let n = params.len();
        let mut grad = vec![0.0; n];

        for i in 0..n {
            let eps = 1e-6 * params[i].abs().max(1.0);

            let mut params_plus = params.to_vec();
            params_plus[i] += eps;
            let f_plus = self.value(&params_plus)?;

            let mut params_minus = params.to_vec();
            params_minus[i] -= eps;
            let f_minus = self.value(&params_minus)?;

            grad[i] = (f_plus - f_minus) / (2.0 * eps);
        }

        Ok(grad)
    }
}

/// Elementwise box constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl Bounds {
    /// Create bounds; fails unless `lower[i] <= upper[i]` for every i.
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self> {
        if lower.len() != upper.len() {
            return Err(LmmError::DimensionMismatch {
                what: "upper bounds".to_string(),
                expected: lower.len(),
                actual: upper.len(),
            });
        }
        for (i, (&lo, &hi)) in lower.iter().zip(&upper).enumerate() {
            if lo.is_nan() || hi.is_nan() {
                return Err(LmmError::InvalidInput(format!("Bound {} is NaN", i)));
            }
            if lo > hi {
                return Err(LmmError::InvalidInput(format!(
                    "Inconsistent bounds at position {}: lower {} > upper {}",
                    i, lo, hi
                )));
            }
        }
        Ok(Self { lower, upper })
    }

    /// No constraints on `n` parameters.
    pub fn unbounded(n: usize) -> Self {
        Self {
            lower: vec![f64::NEG_INFINITY; n],
            upper: vec![f64::INFINITY; n],
        }
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.lower.len()
    }

    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    pub fn lower(&self) -> &[f64] {
        &self.lower
    }

    pub fn upper(&self) -> &[f64] {
        &self.upper
    }

    /// Project a point into the box.
    pub fn clamp(&self, params: &[f64]) -> Vec<f64> {
        params
            .iter()
            .zip(self.lower.iter().zip(&self.upper))
            .map(|(&v, (&lo, &hi))| v.clamp(lo, hi))
            .collect()
    }

    /// Whether a point lies inside the box.
    pub fn contains(&self, params: &[f64]) -> bool {
        params.len() == self.len()
            && params
                .iter()
                .zip(self.lower.iter().zip(&self.upper))
                .all(|(&v, (&lo, &hi))| v >= lo && v <= hi)
    }

    /// Zero the components of a minimization gradient that push out of the box at
    /// an active bound.
    pub fn project_gradient(&self, params: &[f64], gradient: &mut [f64]) {
        const EPS: f64 = 1e-12;
        for (i, g) in gradient.iter_mut().enumerate() {
            let x = params[i];
            if x <= self.lower[i] + EPS && *g > 0.0 {
                *g = 0.0;
            }
            if x >= self.upper[i] - EPS && *g < 0.0 {
                *g = 0.0;
            }
        }
    }
}

/// Settings shared by the optimizer backends.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Maximum number of iterations.
    pub max_iter: u64,
    /// Convergence tolerance (projected-gradient norm for L-BFGS).
    pub tol: f64,
    /// Number of corrections kept by L-BFGS.
    pub memory: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            tol: 1e-6,
            memory: 10,
        }
    }
}

/// Convergence diagnostics of one optimization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Iterations performed.
    pub iterations: u64,
    /// Objective evaluations.
    pub cost_evaluations: usize,
    /// Gradient evaluations.
    pub gradient_evaluations: usize,
    /// Norm of the projected gradient at the returned point.
    pub gradient_norm: f64,
    /// Whether the stopping criterion was met.
    pub converged: bool,
    /// Termination message.
    pub message: String,
}

/// Result of a maximization.
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Best point found (inside the bounds).
    pub argmax: Vec<f64>,
    /// Objective value at `argmax`.
    pub value: f64,
    pub diagnostics: Diagnostics,
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OptimizationResult(value={:.6}, iterations={}, n_fev={}, n_gev={}, converged={})",
            self.value,
            self.diagnostics.iterations,
            self.diagnostics.cost_evaluations,
            self.diagnostics.gradient_evaluations,
            self.diagnostics.converged
        )
    }
}

/// Capability to maximize an objective over a box.
pub trait BoxConstrainedOptimizer: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Maximize `objective` over `bounds` starting from `initial`.
    fn maximize(
        &self,
        objective: &dyn Objective,
        bounds: &Bounds,
        initial: &[f64],
    ) -> Result<OptimizationResult>;
}

/// Selectable optimizer backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizerKind {
    #[default]
    Lbfgs,
    NelderMead,
}

impl OptimizerKind {
    /// Instantiate the backend.
    pub fn build(self, config: OptimizerConfig) -> Box<dyn BoxConstrainedOptimizer> {
        match self {
            OptimizerKind::Lbfgs => Box::new(LbfgsOptimizer::new(config)),
            OptimizerKind::NelderMead => Box::new(NelderMeadOptimizer::new(config)),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Lbfgs => write!(f, "lbfgs"),
            OptimizerKind::NelderMead => write!(f, "nelder-mead"),
        }
    }
}

#[derive(Default)]
pub(crate) struct FuncCounts {
    cost: AtomicUsize,
    grad: AtomicUsize,
}

impl FuncCounts {
    fn add_cost(&self) {
        self.cost.fetch_add(1, Ordering::Relaxed);
    }

    fn add_grad(&self) {
        self.grad.fetch_add(1, Ordering::Relaxed);
    }

    fn costs(&self) -> usize {
        self.cost.load(Ordering::Relaxed)
    }

    fn grads(&self) -> usize {
        self.grad.load(Ordering::Relaxed)
    }
}

/// Objective value as a cost to minimize, with a finiteness check.
fn negated_cost(objective: &dyn Objective, params: &[f64]) -> Result<f64> {
    let value = objective.value(params)?;
    if !value.is_finite() {
        return Err(LmmError::NumericalFailure(format!(
            "Non-finite objective {} at {:?}",
            value, params
        )));
    }
    Ok(-value)
}

/// Projected-gradient norm of the maximization problem at `params`.
fn projected_gradient_norm(
    objective: &dyn Objective,
    bounds: &Bounds,
    params: &[f64],
) -> Result<f64> {
    let mut g: Vec<f64> = objective.gradient(params)?.iter().map(|v| -v).collect();
    bounds.project_gradient(params, &mut g);
    Ok(g.iter().map(|v| v * v).sum::<f64>().sqrt())
}

fn check_problem(bounds: &Bounds, initial: &[f64]) -> Result<()> {
    if initial.len() != bounds.len() {
        return Err(LmmError::DimensionMismatch {
            what: "initial guess".to_string(),
            expected: bounds.len(),
            actual: initial.len(),
        });
    }
    if initial.iter().any(|v| !v.is_finite()) {
        return Err(LmmError::InvalidInput(
            "Initial guess must be finite".to_string(),
        ));
    }
    Ok(())
}
