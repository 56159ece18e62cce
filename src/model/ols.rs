//! Ordinary least squares with the ML residual variance.
//!
//! Used for the default starting point of the mixed-model fit and as the
//! σs² = 0 null model of the likelihood-ratio test.

use crate::error::{LmmError, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Results from an OLS fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OlsFit {
    /// Estimated coefficients.
    pub coefficients: Vec<f64>,
    /// Standard errors of coefficients (unbiased residual variance).
    pub std_errors: Vec<f64>,
    /// Residuals.
    #[serde(skip)]
    pub residuals: Vec<f64>,
    /// Residual sum of squares.
    pub rss: f64,
    /// ML residual variance rss / n.
    pub sigma_squared_ml: f64,
    /// Degrees of freedom (residual).
    pub df_residual: usize,
    /// Gaussian log-likelihood at the ML estimates.
    pub log_likelihood: f64,
}

impl OlsFit {
    /// Calculate t-statistic for a coefficient.
    pub fn t_statistic(&self, index: usize) -> Option<f64> {
        let coef = self.coefficients.get(index)?;
        let se = self.std_errors.get(index)?;
        if *se > 0.0 {
            Some(coef / se)
        } else {
            None
        }
    }
}

/// Fit Y = Xβ + ε by least squares.
pub fn fit_ols(y: &[f64], x: &DMatrix<f64>) -> Result<OlsFit> {
    let n = y.len();
    let p = x.ncols();

    if x.nrows() != n {
        return Err(LmmError::DimensionMismatch {
            what: "design matrix rows".to_string(),
            expected: n,
            actual: x.nrows(),
        });
    }
    if n == 0 {
        return Err(LmmError::EmptyData("No observations".to_string()));
    }

    let xtx = x.transpose() * x;
    let xtx_inv = xtx.try_inverse().ok_or_else(|| {
        LmmError::InvalidInput("Design matrix is singular (X'X not invertible)".to_string())
    })?;

    let y_vec = DVector::from_column_slice(y);
    let beta = &xtx_inv * (x.transpose() * &y_vec);
    let residuals_vec = &y_vec - x * &beta;
    let rss = residuals_vec.norm_squared();

    let df_residual = n.saturating_sub(p);
    let sigma = if df_residual > 0 {
        (rss / df_residual as f64).sqrt()
    } else {
        f64::NAN
    };
    let std_errors: Vec<f64> = (0..p)
        .map(|j| sigma * xtx_inv[(j, j)].max(0.0).sqrt())
        .collect();

    let sigma_squared_ml = rss / n as f64;
    let log_likelihood = -0.5 * n as f64 * ((2.0 * PI * sigma_squared_ml).ln() + 1.0);

    Ok(OlsFit {
        coefficients: beta.iter().copied().collect(),
        std_errors,
        residuals: residuals_vec.iter().copied().collect(),
        rss,
        sigma_squared_ml,
        df_residual,
        log_likelihood,
    })
}
