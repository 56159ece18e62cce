//! Maximum-likelihood fitting of the random-intercept linear mixed model.
//!
//! `y = Xβ + Ku + ε` where `u ~ N(0, σs²I_m)` and `ε ~ N(0, σ²I_n)`.
//!
//! The log-likelihood is maximized directly (ML, not REML) over the box
//! constraints on θ = (σ, σs, β) with a [`BoxConstrainedOptimizer`].
//!
//! # Example
//! ```
//! use lmm_mle::data::Grouping;
//! use lmm_mle::model::{fit_lmm, LmmConfig};
//! use nalgebra::DMatrix;
//!
//! let y = [10.0, 25.0, 3.0, 6.0];
//! let x = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0]);
//! let groups = Grouping::from_labels(&["Ind1", "Ind1", "Ind2", "Ind2"]);
//!
//! let fit = fit_lmm(&y, &x, &groups, &LmmConfig::default()).unwrap();
//! assert!((fit.beta[1] - 9.0).abs() < 1e-4);
//! assert!((fit.sigma_s_squared - 33.25).abs() < 1e-3);
//! ```

use crate::data::{DesignMatrix, Grouping, ModelFrame, Table};
use crate::error::{LmmError, Result};
use crate::model::likelihood::LogLikelihood;
use crate::model::ols::fit_ols;
use crate::model::params::Theta;
use crate::optim::{
    Bounds, BoxConstrainedOptimizer, Diagnostics, Objective, OptimizerConfig, OptimizerKind,
};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Configuration for LMM fitting.
///
/// Bounds and the initial guess use the flat layout `[σ, σs, β₀, …, β_{p−1}]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LmmConfig {
    /// Starting point; method-of-moments estimate from OLS residuals if absent.
    pub initial_guess: Option<Vec<f64>>,
    /// Lower bounds; standard deviations default to `sqrt(variance_floor)`, β to −∞.
    pub lower_bounds: Option<Vec<f64>>,
    /// Upper bounds; standard deviations default to `10·max(sd(y), 1)`, β to +∞.
    pub upper_bounds: Option<Vec<f64>>,
    /// Maximum optimizer iterations.
    pub max_iterations: u64,
    /// Convergence tolerance (projected-gradient norm).
    pub tolerance: f64,
    /// Lower bound on σ² and σs². Biases estimates whose true value is at or near zero.
    pub variance_floor: f64,
    /// Number of corrections kept by L-BFGS.
    pub lbfgs_memory: usize,
    /// Optimizer backend.
    pub optimizer: OptimizerKind,
}

impl Default for LmmConfig {
    fn default() -> Self {
        Self {
            initial_guess: None,
            lower_bounds: None,
            upper_bounds: None,
            max_iterations: 1000,
            tolerance: 1e-6,
            variance_floor: 1e-6,
            lbfgs_memory: 10,
            optimizer: OptimizerKind::Lbfgs,
        }
    }
}

impl LmmConfig {
    /// Parse from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(LmmError::from)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(LmmError::from)
    }

    fn optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig {
            max_iter: self.max_iterations,
            tol: self.tolerance,
            memory: self.lbfgs_memory,
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.variance_floor.is_finite() || self.variance_floor < 0.0 {
            return Err(LmmError::InvalidInput(format!(
                "variance_floor must be finite and >= 0, got {}",
                self.variance_floor
            )));
        }
        if self.max_iterations == 0 {
            return Err(LmmError::InvalidInput(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(LmmError::InvalidInput(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.lbfgs_memory == 0 {
            return Err(LmmError::InvalidInput(
                "lbfgs_memory must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of the optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    /// Tolerance met.
    Converged,
    /// Iteration budget exhausted.
    DidNotConverge,
    /// Every group is a singleton; only σ² + σs² is identified.
    Degenerate,
}

impl fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceStatus::Converged => write!(f, "converged"),
            ConvergenceStatus::DidNotConverge => write!(f, "did not converge"),
            ConvergenceStatus::Degenerate => write!(f, "degenerate"),
        }
    }
}

/// Results from fitting the random-intercept model.
#[derive(Debug, Clone, Serialize)]
pub struct LmmFit {
    /// Estimated fixed effects β̂.
    pub beta: Vec<f64>,
    /// Standard errors of β̂ from (XᵗΣy⁻¹X)⁻¹.
    pub std_errors: Vec<f64>,
    /// Residual variance σ̂².
    pub sigma_squared: f64,
    /// Random-intercept variance σ̂s².
    pub sigma_s_squared: f64,
    /// BLUPs of the random intercepts, one per group.
    pub random_effects: Vec<f64>,
    /// ML log-likelihood at the optimum.
    pub log_likelihood: f64,
    pub converged: bool,
    pub status: ConvergenceStatus,
    pub iterations: u64,
    pub diagnostics: Diagnostics,
    /// Optimizer backend name.
    pub optimizer: String,
    /// Intraclass correlation σs² / (σs² + σ²).
    pub icc: f64,
    pub aic: f64,
    pub bic: f64,
    pub n_obs: usize,
    pub n_groups: usize,
    /// Fixed effect coefficient names.
    pub coefficient_names: Vec<String>,
    pub group_labels: Vec<String>,
    /// Effective lower bounds in the flat layout.
    pub lower_bounds: Vec<f64>,
    /// Effective upper bounds in the flat layout.
    pub upper_bounds: Vec<f64>,
}

impl LmmFit {
    /// Residual standard deviation σ̂.
    pub fn sigma(&self) -> f64 {
        self.sigma_squared.sqrt()
    }

    /// Random-intercept standard deviation σ̂s.
    pub fn sigma_s(&self) -> f64 {
        self.sigma_s_squared.sqrt()
    }

    /// Estimates in the flat layout.
    pub fn theta(&self) -> Theta {
        Theta::new(self.sigma(), self.sigma_s(), self.beta.clone())
    }

    /// Get coefficient index by name.
    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    /// Get coefficient by name.
    pub fn coefficient(&self, name: &str) -> Option<f64> {
        self.coefficient_index(name).map(|i| self.beta[i])
    }

    /// Get standard error by index.
    pub fn get_std_error(&self, index: usize) -> Option<f64> {
        self.std_errors.get(index).copied()
    }

    /// BLUP of one group by label.
    pub fn random_effect(&self, group: &str) -> Option<f64> {
        self.group_labels
            .iter()
            .position(|g| g == group)
            .and_then(|i| self.random_effects.get(i).copied())
    }

    /// Names of the standard deviations that ended at their lower bound.
    pub fn on_boundary(&self) -> Vec<&'static str> {
        let theta = [self.sigma(), self.sigma_s()];
        ["sigma", "sigma_s"]
            .into_iter()
            .zip(theta)
            .zip(&self.lower_bounds)
            .filter(|&((_, value), &lower)| value <= lower + 1e-8 * lower.abs().max(1.0))
            .map(|((name, _), _)| name)
            .collect()
    }
}

impl fmt::Display for LmmFit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Linear mixed model fit by maximum likelihood ({}, {})",
            self.optimizer, self.status
        )?;
        writeln!(
            f,
            "  logLik = {:.6}  AIC = {:.4}  BIC = {:.4}  iterations = {}",
            self.log_likelihood, self.aic, self.bic, self.iterations
        )?;
        writeln!(f, "Random effects:")?;
        writeln!(
            f,
            "  group     variance = {:.6}  sd = {:.6}",
            self.sigma_s_squared,
            self.sigma_s()
        )?;
        writeln!(
            f,
            "  residual  variance = {:.6}  sd = {:.6}",
            self.sigma_squared,
            self.sigma()
        )?;
        writeln!(f, "  ICC = {:.4}", self.icc)?;
        writeln!(f, "Fixed effects:")?;
        for ((name, b), se) in self
            .coefficient_names
            .iter()
            .zip(&self.beta)
            .zip(&self.std_errors)
        {
            writeln!(f, "  {:<20} {:>14.6} {:>12.6}", name, b, se)?;
        }
        write!(
            f,
            "Number of obs: {}, groups: {}",
            self.n_obs, self.n_groups
        )
    }
}

/// Random-intercept LMM estimator.
pub struct LmmEstimator {
    config: LmmConfig,
    optimizer: Box<dyn BoxConstrainedOptimizer>,
}

impl LmmEstimator {
    /// Estimator with the backend selected by `config.optimizer`.
    pub fn new(config: LmmConfig) -> Self {
        let optimizer = config.optimizer.build(config.optimizer_config());
        Self { config, optimizer }
    }

    /// Estimator with an injected optimizer.
    pub fn with_optimizer(config: LmmConfig, optimizer: Box<dyn BoxConstrainedOptimizer>) -> Self {
        Self { config, optimizer }
    }

    pub fn config(&self) -> &LmmConfig {
        &self.config
    }

    /// Fit the model; coefficients are named `beta0`, `beta1`, ….
    pub fn fit(&self, y: &[f64], x: &DMatrix<f64>, groups: &Grouping) -> Result<LmmFit> {
        let names: Vec<String> = (0..x.ncols()).map(|j| format!("beta{}", j)).collect();
        self.fit_named(y, x, &names, groups)
    }

    /// Fit the model with coefficient names from a design matrix.
    pub fn fit_design(&self, y: &[f64], design: &DesignMatrix, groups: &Grouping) -> Result<LmmFit> {
        self.fit_named(y, design.matrix(), design.coefficient_names(), groups)
    }

    /// Fit independent responses sharing X and G, in parallel.
    pub fn fit_responses(
        &self,
        responses: &[Vec<f64>],
        x: &DMatrix<f64>,
        groups: &Grouping,
    ) -> Vec<Result<LmmFit>> {
        responses
            .par_iter()
            .map(|y| self.fit(y, x, groups))
            .collect()
    }

    fn fit_named(
        &self,
        y: &[f64],
        x: &DMatrix<f64>,
        coefficient_names: &[String],
        groups: &Grouping,
    ) -> Result<LmmFit> {
        self.config.validate()?;
        validate_data(y, x, groups)?;

        let objective = LogLikelihood::new(y, x, groups)?;
        let bounds = self.resolve_bounds(y, objective.n_params())?;
        let initial = match &self.config.initial_guess {
            Some(guess) => {
                check_length("initial guess", guess, objective.n_params())?;
                if !bounds.contains(guess) {
                    return Err(LmmError::InvalidInput(format!(
                        "Initial guess {:?} lies outside the bounds [{:?}, {:?}]",
                        guess,
                        bounds.lower(),
                        bounds.upper()
                    )));
                }
                guess.clone()
            }
            None => default_initial_guess(y, x, groups, &bounds)?,
        };
        debug!(
            "Fitting LMM: n = {}, p = {}, m = {}, initial guess {:?}",
            y.len(),
            x.ncols(),
            groups.n_groups(),
            initial
        );

        // Σy must be positive definite where the search starts.
        let start_value = objective.value(&initial)?;
        if !start_value.is_finite() {
            return Err(LmmError::NumericalFailure(format!(
                "Non-finite log-likelihood at the initial guess {:?}",
                initial
            )));
        }

        let result = self.optimizer.maximize(&objective, &bounds, &initial)?;
        debug!("{} {}", self.optimizer.name(), result);

        let theta = Theta::from_slice(&result.argmax, x.ncols())?;
        let converged = result.diagnostics.converged;
        let status = if !converged {
            ConvergenceStatus::DidNotConverge
        } else if groups.all_singletons() {
            warn!(
                "Every group holds a single observation: sigma^2 and sigma_s^2 are not \
                 separately identifiable, only their sum {:.6} is meaningful",
                theta.sigma_squared() + theta.sigma_s_squared()
            );
            ConvergenceStatus::Degenerate
        } else {
            ConvergenceStatus::Converged
        };

        let fit = assemble_fit(
            &objective,
            &theta,
            &bounds,
            coefficient_names,
            groups,
            result.diagnostics,
            self.optimizer.name(),
            status,
        )?;

        if !converged {
            let reason = fit.diagnostics.message.clone();
            warn!(
                "Optimizer stopped without meeting the tolerance after {} iterations: {}",
                fit.iterations, reason
            );
            return Err(LmmError::NotConverged {
                iterations: fit.iterations,
                reason,
                fit: Box::new(fit),
            });
        }

        let boundary = fit.on_boundary();
        if !boundary.is_empty() {
            warn!(
                "{} ended at the lower bound {:?} (variance_floor = {:e}); the estimate is \
                 limited by the bound, lower variance_floor if the data are on a small scale",
                boundary.join(", "),
                &fit.lower_bounds[..Theta::BETA_OFFSET],
                self.config.variance_floor
            );
        }
        Ok(fit)
    }

    /// Effective bounds: user bounds (or defaults), with the variance floor applied.
    fn resolve_bounds(&self, y: &[f64], n_params: usize) -> Result<Bounds> {
        let sd_floor = self.config.variance_floor.sqrt();

        let mut lower = match &self.config.lower_bounds {
            Some(lower) => {
                check_length("lower bounds", lower, n_params)?;
                if lower[0] < 0.0 || lower[1] < 0.0 {
                    return Err(LmmError::InvalidInput(format!(
                        "Lower bounds of the standard deviations must be >= 0, got ({}, {})",
                        lower[0], lower[1]
                    )));
                }
                lower.clone()
            }
            None => {
                let mut lower = vec![f64::NEG_INFINITY; n_params];
                lower[0] = 0.0;
                lower[1] = 0.0;
                lower
            }
        };
        lower[0] = lower[0].max(sd_floor);
        lower[1] = lower[1].max(sd_floor);

        let upper = match &self.config.upper_bounds {
            Some(upper) => {
                check_length("upper bounds", upper, n_params)?;
                upper.clone()
            }
            None => {
                let sd_max = 10.0 * sample_sd(y).max(1.0);
                let mut upper = vec![f64::INFINITY; n_params];
                upper[0] = sd_max;
                upper[1] = sd_max;
                upper
            }
        };

        Bounds::new(lower, upper)
    }
}

/// Fit with the backend selected by `config`.
pub fn fit_lmm(
    y: &[f64],
    x: &DMatrix<f64>,
    groups: &Grouping,
    config: &LmmConfig,
) -> Result<LmmFit> {
    LmmEstimator::new(config.clone()).fit(y, x, groups)
}

/// Fit from a table and a formula such as `y ~ treat + (1 | ind)`.
pub fn fit_lmm_from_formula(table: &Table, formula: &str, config: &LmmConfig) -> Result<LmmFit> {
    let frame = ModelFrame::from_formula(table, formula)?;
    LmmEstimator::new(config.clone()).fit_design(&frame.response, &frame.design, &frame.groups)
}

fn check_length(what: &str, values: &[f64], expected: usize) -> Result<()> {
    if values.len() != expected {
        return Err(LmmError::DimensionMismatch {
            what: what.to_string(),
            expected,
            actual: values.len(),
        });
    }
    Ok(())
}

fn validate_data(y: &[f64], x: &DMatrix<f64>, groups: &Grouping) -> Result<()> {
    let n = y.len();
    let p = x.ncols();

    if n == 0 {
        return Err(LmmError::EmptyData("No observations".to_string()));
    }
    if x.nrows() != n {
        return Err(LmmError::DimensionMismatch {
            what: "design matrix rows".to_string(),
            expected: n,
            actual: x.nrows(),
        });
    }
    if groups.len() != n {
        return Err(LmmError::DimensionMismatch {
            what: "grouping vector".to_string(),
            expected: n,
            actual: groups.len(),
        });
    }
    if p == 0 {
        return Err(LmmError::InvalidInput(
            "Design matrix has no columns".to_string(),
        ));
    }
    if n < p + 1 {
        return Err(LmmError::InvalidInput(format!(
            "Need at least p + 1 = {} observations, got {}",
            p + 1,
            n
        )));
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(LmmError::InvalidInput(
            "Response contains non-finite values".to_string(),
        ));
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(LmmError::InvalidInput(
            "Design matrix contains non-finite values".to_string(),
        ));
    }
    let empty = groups.empty_groups();
    if !empty.is_empty() {
        return Err(LmmError::InvalidInput(format!(
            "Groups without observations: {}",
            empty.join(", ")
        )));
    }
    Ok(())
}

/// Sample standard deviation (n − 1 denominator).
fn sample_sd(y: &[f64]) -> f64 {
    let n = y.len();
    if n < 2 {
        return 0.0;
    }
    let mean = y.iter().sum::<f64>() / n as f64;
    let ss: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();
    (ss / (n - 1) as f64).sqrt()
}

/// Method-of-moments starting point from OLS residuals.
///
/// σ² is the pooled within-group residual variance. σs² is the mean square of the
/// group-mean residuals minus their within-group contribution. Singleton groups
/// split the OLS variance evenly. The result is clamped into `bounds`.
fn default_initial_guess(
    y: &[f64],
    x: &DMatrix<f64>,
    groups: &Grouping,
    bounds: &Bounds,
) -> Result<Vec<f64>> {
    let ols = fit_ols(y, x)?;
    let n = y.len();
    let m = groups.n_groups();
    let sizes = groups.group_sizes();

    let mut sums = vec![0.0; m];
    for (r, &g) in ols.residuals.iter().zip(groups.group_indices()) {
        sums[g] += r;
    }
    let means: Vec<f64> = sums
        .iter()
        .zip(&sizes)
        .map(|(s, &k)| s / k as f64)
        .collect();

    let (sigma_squared, sigma_s_squared) = if n > m {
        let within: f64 = ols
            .residuals
            .iter()
            .zip(groups.group_indices())
            .map(|(r, &g)| (r - means[g]).powi(2))
            .sum();
        let sigma_squared = within / (n - m) as f64;
        let between = means.iter().map(|v| v * v).sum::<f64>() / m as f64;
        let mean_inverse_size = sizes.iter().map(|&k| 1.0 / k as f64).sum::<f64>() / m as f64;
        (
            sigma_squared,
            (between - sigma_squared * mean_inverse_size).max(0.0),
        )
    } else {
        (0.5 * ols.sigma_squared_ml, 0.5 * ols.sigma_squared_ml)
    };

    let mut guess = Vec::with_capacity(x.ncols() + Theta::BETA_OFFSET);
    guess.push(sigma_squared.sqrt());
    guess.push(sigma_s_squared.sqrt());
    guess.extend_from_slice(&ols.coefficients);
    Ok(bounds.clamp(&guess))
}

#[allow(clippy::too_many_arguments)]
fn assemble_fit(
    objective: &LogLikelihood,
    theta: &Theta,
    bounds: &Bounds,
    coefficient_names: &[String],
    groups: &Grouping,
    diagnostics: Diagnostics,
    optimizer: &str,
    status: ConvergenceStatus,
) -> Result<LmmFit> {
    let n = objective.n_obs();
    let p = objective.n_coefficients();
    let sigma_squared = theta.sigma_squared();
    let sigma_s_squared = theta.sigma_s_squared();

    let cov = objective.covariance(theta)?;
    let log_likelihood = objective.evaluate(theta)?;
    let residuals = objective.residuals(&theta.beta);
    let v_inv_r: DVector<f64> = cov.solve(&residuals);

    let x = objective.design();
    let xtvinvx = x.transpose() * cov.solve_matrix(x);
    let std_errors: Vec<f64> = match xtvinvx.try_inverse() {
        Some(inv) => (0..p).map(|j| inv[(j, j)].max(0.0).sqrt()).collect(),
        None => {
            warn!("X'V^-1X is singular; standard errors are unavailable");
            vec![f64::NAN; p]
        }
    };

    // BLUPs: u = σs² Kᵗ Σy⁻¹ (y − Xβ)
    let random_effects: Vec<f64> = (objective.incidence().transpose() * &v_inv_r * sigma_s_squared)
        .iter()
        .copied()
        .collect();

    let total = sigma_squared + sigma_s_squared;
    let icc = if total > 0.0 {
        sigma_s_squared / total
    } else {
        f64::NAN
    };

    let k = (p + Theta::BETA_OFFSET) as f64;
    let aic = -2.0 * log_likelihood + 2.0 * k;
    let bic = -2.0 * log_likelihood + k * (n as f64).ln();

    Ok(LmmFit {
        beta: theta.beta.clone(),
        std_errors,
        sigma_squared,
        sigma_s_squared,
        random_effects,
        log_likelihood,
        converged: status != ConvergenceStatus::DidNotConverge,
        status,
        iterations: diagnostics.iterations,
        diagnostics,
        optimizer: optimizer.to_string(),
        icc,
        aic,
        bic,
        n_obs: n,
        n_groups: groups.n_groups(),
        coefficient_names: coefficient_names.to_vec(),
        group_labels: groups.group_labels().to_vec(),
        lower_bounds: bounds.lower().to_vec(),
        upper_bounds: bounds.upper().to_vec(),
    })
}
