//! Marginal covariance of the response: Σy = σs²·KKᵗ + σ²·I.
//!
//! Σy is rebuilt for every evaluation and only ever used through its Cholesky
//! factor. No explicit inverse is formed.

use crate::error::{LmmError, Result};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

/// Cholesky-factored marginal covariance.
#[derive(Debug)]
pub struct MarginalCovariance {
    chol: Cholesky<f64, Dyn>,
}

impl MarginalCovariance {
    /// Factor Σy for the given variances and incidence matrix K.
    ///
    /// Fails with `NumericalFailure` when Σy is not positive definite, e.g. both
    /// variances at zero.
    pub fn new(sigma_squared: f64, sigma_s_squared: f64, incidence: &DMatrix<f64>) -> Result<Self> {
        if !sigma_squared.is_finite() || !sigma_s_squared.is_finite() {
            return Err(LmmError::NumericalFailure(format!(
                "Non-finite variance components (sigma^2 = {}, sigma_s^2 = {})",
                sigma_squared, sigma_s_squared
            )));
        }
        let v = build_v_matrix(sigma_squared, sigma_s_squared, incidence);
        let chol = v.cholesky().ok_or_else(|| {
            LmmError::NumericalFailure(format!(
                "Covariance matrix is not positive definite (sigma^2 = {}, sigma_s^2 = {})",
                sigma_squared, sigma_s_squared
            ))
        })?;
        if chol.l_dirty().diagonal().iter().any(|&d| d <= 0.0 || !d.is_finite()) {
            return Err(LmmError::NumericalFailure(
                "Degenerate Cholesky factor of the covariance matrix".to_string(),
            ));
        }
        Ok(Self { chol })
    }

    /// Dimension n.
    pub fn dim(&self) -> usize {
        self.chol.l_dirty().nrows()
    }

    /// log det Σy from the factor's diagonal.
    pub fn log_det(&self) -> f64 {
        2.0 * self.chol.l_dirty().diagonal().map(|x| x.ln()).sum()
    }

    /// Σy⁻¹ b.
    pub fn solve(&self, b: &DVector<f64>) -> DVector<f64> {
        self.chol.solve(b)
    }

    /// Σy⁻¹ B.
    pub fn solve_matrix(&self, b: &DMatrix<f64>) -> DMatrix<f64> {
        self.chol.solve(b)
    }

    /// L⁻¹ B for the lower factor L.
    fn whiten(&self, b: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        self.chol
            .l()
            .solve_lower_triangular(b)
            .ok_or_else(|| LmmError::NumericalFailure("Singular Cholesky factor".to_string()))
    }

    /// tr(Σy⁻¹) = ‖L⁻¹‖_F².
    pub fn trace_inverse(&self) -> Result<f64> {
        let n = self.dim();
        Ok(self.whiten(&DMatrix::identity(n, n))?.norm_squared())
    }

    /// tr(KᵗΣy⁻¹K) = ‖L⁻¹K‖_F².
    pub fn trace_projected(&self, incidence: &DMatrix<f64>) -> Result<f64> {
        Ok(self.whiten(incidence)?.norm_squared())
    }
}

/// Σy = σs²·KKᵗ + σ²·I
fn build_v_matrix(sigma_squared: f64, sigma_s_squared: f64, incidence: &DMatrix<f64>) -> DMatrix<f64> {
    let n = incidence.nrows();
    let mut v = (incidence * incidence.transpose()) * sigma_s_squared;
    for i in 0..n {
        v[(i, i)] += sigma_squared;
    }
    v
}
