//! Parameter vector of the random-intercept model.

use crate::error::{LmmError, Result};
use serde::{Deserialize, Serialize};

/// Model parameters θ = (σ, σs, β).
///
/// The flat layout shared by bounds, initial guesses and the optimizer state is
/// `[σ, σs, β₀, …, β_{p−1}]`. Standard deviations are stored, not variances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theta {
    /// Residual standard deviation σ.
    pub sigma: f64,
    /// Random-intercept standard deviation σs.
    pub sigma_s: f64,
    /// Fixed-effect coefficients.
    pub beta: Vec<f64>,
}

impl Theta {
    /// Offset of β₀ in the flat layout.
    pub const BETA_OFFSET: usize = 2;

    pub fn new(sigma: f64, sigma_s: f64, beta: Vec<f64>) -> Self {
        Self {
            sigma,
            sigma_s,
            beta,
        }
    }

    /// Read θ from the flat layout; `params` must hold p + 2 values.
    pub fn from_slice(params: &[f64], n_coefficients: usize) -> Result<Self> {
        let expected = n_coefficients + Self::BETA_OFFSET;
        if params.len() != expected {
            return Err(LmmError::DimensionMismatch {
                what: "parameter vector".to_string(),
                expected,
                actual: params.len(),
            });
        }
        Ok(Self {
            sigma: params[0],
            sigma_s: params[1],
            beta: params[Self::BETA_OFFSET..].to_vec(),
        })
    }

    /// Flat layout `[σ, σs, β…]`.
    pub fn to_vec(&self) -> Vec<f64> {
        let mut v = Vec::with_capacity(self.len());
        v.push(self.sigma);
        v.push(self.sigma_s);
        v.extend_from_slice(&self.beta);
        v
    }

    /// Length of the flat layout.
    pub fn len(&self) -> usize {
        self.beta.len() + Self::BETA_OFFSET
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn n_coefficients(&self) -> usize {
        self.beta.len()
    }

    /// Residual variance σ².
    pub fn sigma_squared(&self) -> f64 {
        self.sigma * self.sigma
    }

    /// Random-intercept variance σs².
    pub fn sigma_s_squared(&self) -> f64 {
        self.sigma_s * self.sigma_s
    }

    /// Human-readable names in flat order.
    pub fn parameter_names(coefficient_names: &[String]) -> Vec<String> {
        let mut names = vec!["sigma".to_string(), "sigma_s".to_string()];
        names.extend(coefficient_names.iter().cloned());
        names
    }
}
