//! Error types for the lmm-mle library.

use crate::model::LmmFit;
use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum LmmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("Missing column '{0}' in table")]
    MissingColumn(String),

    #[error("Formula parse error: {0}")]
    FormulaParse(String),

    #[error("Empty data: {0}")]
    EmptyData(String),

    #[error("Numerical failure: {0}")]
    NumericalFailure(String),

    /// The optimizer stopped short of the tolerance, either with the iteration
    /// budget spent or after a solver abort named in `reason`. The last iterate is
    /// kept so callers can inspect it.
    #[error("Optimizer stopped after {iterations} iterations without converging: {reason} (log-likelihood {:.6} at last iterate)", .fit.log_likelihood)]
    NotConverged {
        iterations: u64,
        reason: String,
        fit: Box<LmmFit>,
    },

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LmmError {
    /// Caller errors: malformed dimensions, empty groups, inconsistent bounds or formulas.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            LmmError::InvalidInput(_)
                | LmmError::DimensionMismatch { .. }
                | LmmError::MissingColumn(_)
                | LmmError::FormulaParse(_)
                | LmmError::EmptyData(_)
        )
    }

    /// Singular covariance, non-finite objective, or an exhausted iteration budget.
    pub fn is_numerical_failure(&self) -> bool {
        matches!(
            self,
            LmmError::NumericalFailure(_) | LmmError::NotConverged { .. }
        )
    }

    /// The best iterate found before the optimizer gave up, if any.
    pub fn last_iterate(&self) -> Option<&LmmFit> {
        match self {
            LmmError::NotConverged { fit, .. } => Some(fit),
            _ => None,
        }
    }
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, LmmError>;
