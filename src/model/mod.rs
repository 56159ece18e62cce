//! Random-intercept linear mixed model and its building blocks.

pub mod covariance;
pub mod likelihood;
pub mod lmm;
pub mod ols;
pub mod params;

pub use covariance::MarginalCovariance;
pub use likelihood::{log_likelihood, LogLikelihood};
pub use lmm::{fit_lmm, fit_lmm_from_formula, ConvergenceStatus, LmmConfig, LmmEstimator, LmmFit};
pub use ols::{fit_ols, OlsFit};
pub use params::Theta;
