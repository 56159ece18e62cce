//! ML log-likelihood of the random-intercept model and its analytic gradient.
//!
//! ```text
//! log L(θ) = −n/2·log(2π) − ½·log det Σy − ½·rᵗΣy⁻¹r,   r = Y − Xβ
//! ```
//!
//! With w = Σy⁻¹r the score is
//!
//! ```text
//! ∂/∂β   = Xᵗw
//! ∂/∂σ²  = −½·tr(Σy⁻¹)     + ½·‖w‖²
//! ∂/∂σs² = −½·tr(KᵗΣy⁻¹K)  + ½·‖Kᵗw‖²
//! ```
//!
//! and the chain rule ∂/∂σ = 2σ·∂/∂σ² maps it onto the standard-deviation layout.

use crate::data::Grouping;
use crate::error::{LmmError, Result};
use crate::model::covariance::MarginalCovariance;
use crate::model::params::Theta;
use crate::optim::Objective;
use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;

/// The log-likelihood as an [`Objective`] over the flat θ layout.
#[derive(Debug, Clone)]
pub struct LogLikelihood {
    y: DVector<f64>,
    x: DMatrix<f64>,
    incidence: DMatrix<f64>,
}

impl LogLikelihood {
    /// Validate dimensions and capture Y, X and K.
    pub fn new(y: &[f64], x: &DMatrix<f64>, groups: &Grouping) -> Result<Self> {
        if x.nrows() != y.len() {
            return Err(LmmError::DimensionMismatch {
                what: "design matrix rows".to_string(),
                expected: y.len(),
                actual: x.nrows(),
            });
        }
        if groups.len() != y.len() {
            return Err(LmmError::DimensionMismatch {
                what: "grouping vector".to_string(),
                expected: y.len(),
                actual: groups.len(),
            });
        }
        Ok(Self {
            y: DVector::from_column_slice(y),
            x: x.clone(),
            incidence: groups.incidence_matrix(),
        })
    }

    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn n_coefficients(&self) -> usize {
        self.x.ncols()
    }

    /// Length of the flat parameter vector (p + 2).
    pub fn n_params(&self) -> usize {
        self.x.ncols() + Theta::BETA_OFFSET
    }

    pub fn incidence(&self) -> &DMatrix<f64> {
        &self.incidence
    }

    pub fn design(&self) -> &DMatrix<f64> {
        &self.x
    }

    pub fn response(&self) -> &DVector<f64> {
        &self.y
    }

    /// Factor Σy at θ.
    pub fn covariance(&self, theta: &Theta) -> Result<MarginalCovariance> {
        MarginalCovariance::new(theta.sigma_squared(), theta.sigma_s_squared(), &self.incidence)
    }

    /// Residuals Y − Xβ.
    pub fn residuals(&self, beta: &[f64]) -> DVector<f64> {
        &self.y - &self.x * DVector::from_column_slice(beta)
    }

    /// log L at θ.
    pub fn evaluate(&self, theta: &Theta) -> Result<f64> {
        let cov = self.covariance(theta)?;
        let r = self.residuals(&theta.beta);
        let quad = r.dot(&cov.solve(&r));
        let n = self.n_obs() as f64;
        Ok(-0.5 * n * (2.0 * PI).ln() - 0.5 * cov.log_det() - 0.5 * quad)
    }

    /// Score in the flat layout `[∂σ, ∂σs, ∂β…]`.
    pub fn score(&self, theta: &Theta) -> Result<Vec<f64>> {
        let cov = self.covariance(theta)?;
        let r = self.residuals(&theta.beta);
        let w = cov.solve(&r);

        let d_beta = self.x.transpose() * &w;
        let d_sigma2 = -0.5 * cov.trace_inverse()? + 0.5 * w.norm_squared();
        let ktw = self.incidence.transpose() * &w;
        let d_sigma_s2 = -0.5 * cov.trace_projected(&self.incidence)? + 0.5 * ktw.norm_squared();

        let mut grad = Vec::with_capacity(theta.len());
        grad.push(2.0 * theta.sigma * d_sigma2);
        grad.push(2.0 * theta.sigma_s * d_sigma_s2);
        grad.extend(d_beta.iter().copied());
        Ok(grad)
    }
}

impl Objective for LogLikelihood {
    fn value(&self, params: &[f64]) -> Result<f64> {
        let theta = Theta::from_slice(params, self.n_coefficients())?;
        self.evaluate(&theta)
    }

    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let theta = Theta::from_slice(params, self.n_coefficients())?;
        self.score(&theta)
    }
}

/// Evaluate the ML log-likelihood at an arbitrary θ.
///
/// # Examples
/// ```
/// use lmm_mle::data::Grouping;
/// use lmm_mle::model::{log_likelihood, Theta};
/// use nalgebra::DMatrix;
///
/// let y = [10.0, 25.0, 3.0, 6.0];
/// let x = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0]);
/// let groups = Grouping::from_labels(&["Ind1", "Ind1", "Ind2", "Ind2"]);
/// let theta = Theta::new(18f64.sqrt(), 33.25f64.sqrt(), vec![6.5, 9.0]);
/// let ll = log_likelihood(&y, &x, &groups, &theta).unwrap();
/// assert!((ll + 13.0028774).abs() < 1e-6);
/// ```
pub fn log_likelihood(
    y: &[f64],
    x: &DMatrix<f64>,
    groups: &Grouping,
    theta: &Theta,
) -> Result<f64> {
    let objective = LogLikelihood::new(y, x, groups)?;
    if theta.n_coefficients() != objective.n_coefficients() {
        return Err(LmmError::DimensionMismatch {
            what: "fixed-effect coefficients".to_string(),
            expected: objective.n_coefficients(),
            actual: theta.n_coefficients(),
        });
    }
    objective.evaluate(theta)
}
