//! Maximum-likelihood random-intercept linear mixed models.
//!
//! Fits `Y = Xβ + Ku + ε` with `u ~ N(0, σs²I)` and `ε ~ N(0, σ²I)` for a single
//! grouping factor by directly maximizing the ML log-likelihood under box
//! constraints.
//!
//! # Overview
//!
//! - **data**: Observation tables, formulas, design matrices, grouping factors
//! - **model**: Log-likelihood, covariance, OLS and the mixed-model estimator
//! - **optim**: Box-constrained optimizers (L-BFGS, Nelder–Mead)
//! - **test**: Wald, paired t and likelihood-ratio tests
//!
//! # Example
//!
//! ```no_run
//! use lmm_mle::prelude::*;
//!
//! let table = Table::from_tsv("data.tsv").unwrap();
//! let fit = fit_lmm_from_formula(&table, "y ~ treat + (1 | ind)", &LmmConfig::default()).unwrap();
//! println!("{}", fit);
//! ```

pub mod data;
pub mod error;
pub mod model;
pub mod optim;
pub mod test;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::data::{
        DesignMatrix, Formula, Grouping, MixedFormula, ModelFrame, Table, Term, Variable,
    };
    pub use crate::error::{LmmError, Result};
    pub use crate::model::{
        fit_lmm, fit_lmm_from_formula, fit_ols, log_likelihood, ConvergenceStatus, LmmConfig,
        LmmEstimator, LmmFit, LogLikelihood, OlsFit, Theta,
    };
    pub use crate::optim::{
        Bounds, BoxConstrainedOptimizer, Diagnostics, LbfgsOptimizer, NelderMeadOptimizer,
        Objective, OptimizationResult, OptimizerConfig, OptimizerKind,
    };
    pub use crate::test::{
        test_paired, test_random_intercept, test_wald, test_wald_all, LrtResult, PairedResult,
        WaldResult,
    };
}
